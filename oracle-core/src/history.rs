//! # History - Short-Term Memory of the Mover
//!
//! Fixed-capacity ring buffers. When full, the oldest entry is overwritten,
//! so memory stays constant no matter how long the simulation runs.
//!
//! Timestamps are logical milliseconds supplied by the caller.

use serde::{Deserialize, Serialize};

use crate::motion::{DirectionKey, InputSnapshot, MotionSample};
use crate::{INPUT_HISTORY_CAPACITY, MOTION_HISTORY_CAPACITY};

/// Ring buffer with constant capacity
///
/// Entries are append-only: once pushed they can be read but never changed,
/// and they leave the buffer only by being overwritten.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryBuffer<T> {
    /// The circular storage
    buffer: Vec<Option<T>>,
    /// Where the next entry goes
    write_pos: usize,
    /// Number of entries currently held
    count: usize,
    /// Statistics: total entries pushed
    pub total_pushed: u64,
    /// Statistics: total entries overwritten
    pub total_evicted: u64,
}

/// Motion samples, capacity 30 by default
pub type MotionHistory = HistoryBuffer<MotionSample>;

/// Input snapshots, capacity independent of the motion buffer
pub type InputHistory = HistoryBuffer<InputSnapshot>;

impl<T: Clone> HistoryBuffer<T> {
    /// Create a new ring buffer with given capacity (at least 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![None; capacity.max(1)],
            write_pos: 0,
            count: 0,
            total_pushed: 0,
            total_evicted: 0,
        }
    }

    /// Push an entry, overwriting the oldest if full
    pub fn push(&mut self, item: T) {
        self.total_pushed += 1;

        if self.count == self.buffer.len() {
            self.total_evicted += 1;
        } else {
            self.count += 1;
        }

        self.buffer[self.write_pos] = Some(item);
        self.write_pos = (self.write_pos + 1) % self.buffer.len();
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Entry by age order (0 = oldest)
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.count {
            return None;
        }
        let start = (self.write_pos + self.buffer.len() - self.count) % self.buffer.len();
        self.buffer[(start + index) % self.buffer.len()].as_ref()
    }

    /// Most recently pushed entry
    pub fn latest(&self) -> Option<&T> {
        self.count.checked_sub(1).and_then(|i| self.get(i))
    }

    /// Iterate from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.count).filter_map(move |i| self.get(i))
    }

    /// The newest `n` entries (or fewer), oldest first
    pub fn recent(&self, n: usize) -> Vec<&T> {
        let skip = self.count.saturating_sub(n);
        self.iter().skip(skip).collect()
    }

    pub fn clear(&mut self) {
        for slot in self.buffer.iter_mut() {
            *slot = None;
        }
        self.write_pos = 0;
        self.count = 0;
    }
}

impl Default for HistoryBuffer<MotionSample> {
    fn default() -> Self {
        Self::new(MOTION_HISTORY_CAPACITY)
    }
}

impl Default for HistoryBuffer<InputSnapshot> {
    fn default() -> Self {
        Self::new(INPUT_HISTORY_CAPACITY)
    }
}

impl HistoryBuffer<MotionSample> {
    /// Record a new position, deriving velocity, acceleration and heading
    /// from the previous sample.
    pub fn record_position(&mut self, x: f32, y: f32, timestamp: u64) -> MotionSample {
        let sample = MotionSample::follow(self.latest(), x, y, timestamp);
        self.push(sample);
        sample
    }
}

impl HistoryBuffer<InputSnapshot> {
    /// Record the keys held this tick, accumulating held durations from the
    /// previous snapshot.
    pub fn record_keys(&mut self, keys: &[DirectionKey], timestamp: u64) -> InputSnapshot {
        let mut snapshot = InputSnapshot::new(keys, timestamp);

        if let Some(prev) = self.latest() {
            let elapsed = timestamp.saturating_sub(prev.timestamp) as f32;
            for key in DirectionKey::ALL {
                let i = key.index();
                if snapshot.pressed[i] && prev.pressed[i] {
                    snapshot.held_ms[i] = prev.held_ms[i] + elapsed;
                }
            }
        }

        self.push(snapshot);
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_overflow() {
        let mut buf: HistoryBuffer<i32> = HistoryBuffer::new(3);
        assert!(buf.is_empty());

        for i in 1..=4 {
            buf.push(i);
        }

        assert_eq!(buf.len(), 3);
        assert_eq!(buf.get(0), Some(&2), "oldest was evicted");
        assert_eq!(buf.latest(), Some(&4));
        assert_eq!(buf.total_pushed, 4);
        assert_eq!(buf.total_evicted, 1);
    }

    #[test]
    fn test_iter_order_after_wrap() {
        let mut buf: HistoryBuffer<i32> = HistoryBuffer::new(3);
        for i in 1..=5 {
            buf.push(i);
        }
        let collected: Vec<i32> = buf.iter().copied().collect();
        assert_eq!(collected, vec![3, 4, 5]);
    }

    #[test]
    fn test_recent() {
        let mut buf: HistoryBuffer<i32> = HistoryBuffer::new(10);
        for i in 0..6 {
            buf.push(i);
        }
        let last: Vec<i32> = buf.recent(3).into_iter().copied().collect();
        assert_eq!(last, vec![3, 4, 5]);
        assert_eq!(buf.recent(20).len(), 6);
    }

    #[test]
    fn test_motion_capacity_default() {
        let mut motion = MotionHistory::default();
        for t in 0..40 {
            motion.record_position(t as f32, 0.0, t);
        }
        assert_eq!(motion.len(), MOTION_HISTORY_CAPACITY);
        assert_eq!(motion.get(0).map(|s| s.timestamp), Some(10));
    }

    #[test]
    fn test_record_keys_accumulates_hold() {
        let mut input = InputHistory::default();
        input.record_keys(&[DirectionKey::Right], 0);
        input.record_keys(&[DirectionKey::Right], 16);
        let snap = input.record_keys(&[DirectionKey::Right, DirectionKey::Up], 32);

        assert_eq!(snap.held(DirectionKey::Right), 32.0);
        assert_eq!(snap.held(DirectionKey::Up), 0.0, "just pressed");
    }

    #[test]
    fn test_clear() {
        let mut buf: HistoryBuffer<i32> = HistoryBuffer::new(2);
        buf.push(1);
        buf.clear();
        assert!(buf.is_empty());
        assert!(buf.latest().is_none());
    }
}

//! # Features - Encoding Recent Movement as Numbers
//!
//! Every model in the engine sees the same 50-slot vector, built in fixed
//! blocks:
//!
//! | slots  | block | content |
//! |--------|-------|---------|
//! | 0..15  | keys  | last 5 input snapshots × {vertical, horizontal, diagonal} |
//! | 15..35 | kinematics | last 5 motion samples × {vx, vy, ax, ay} |
//! | 35..45 | summary | needs ≥10 samples: velocity stats, turn rate, agent stats |
//! | 45..50 | habits | needs ≥5 snapshots: mean hold per key, press frequency |
//!
//! Missing history leaves zeros. Extraction is a pure function of its
//! inputs and cannot fail.

use serde::{Deserialize, Serialize};

use crate::config::FeatureConfig;
use crate::history::{InputHistory, MotionHistory};
use crate::motion::{heading_changes, AgentState, DirectionKey};
use crate::FEATURE_DIMS;

/// Snapshots / samples encoded individually
const RECENT_WINDOW: usize = 5;

/// Motion samples needed for the summary block
const SUMMARY_MIN_SAMPLES: usize = 10;

/// Input snapshots needed for the habits block
const HABITS_MIN_SNAPSHOTS: usize = 5;

/// Fixed-length model input (always exactly `FEATURE_DIMS` values)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector(Vec<f32>);

impl FeatureVector {
    /// All-zero vector
    pub fn zeros() -> Self {
        Self(vec![0.0; FEATURE_DIMS])
    }

    /// Build from any values, zero-padding or truncating to `FEATURE_DIMS`.
    /// Non-finite values become 0.
    pub fn from_values(values: impl IntoIterator<Item = f32>) -> Self {
        let mut data: Vec<f32> = values
            .into_iter()
            .take(FEATURE_DIMS)
            .map(|v| if v.is_finite() { v } else { 0.0 })
            .collect();
        data.resize(FEATURE_DIMS, 0.0);
        Self(data)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }
}

impl AsRef<[f32]> for FeatureVector {
    fn as_ref(&self) -> &[f32] {
        &self.0
    }
}

/// Turns histories and agent state into a `FeatureVector`
#[derive(Clone, Debug, Default)]
pub struct FeatureExtractor {
    config: FeatureConfig,
}

impl FeatureExtractor {
    pub fn new(config: FeatureConfig) -> Self {
        Self { config }
    }

    pub fn extract(
        &self,
        input: &InputHistory,
        motion: &MotionHistory,
        agent: &AgentState,
    ) -> FeatureVector {
        let mut values = Vec::with_capacity(FEATURE_DIMS);

        self.key_block(input, &mut values);
        self.kinematic_block(motion, &mut values);
        self.summary_block(motion, agent, &mut values);
        self.habit_block(input, &mut values);

        FeatureVector::from_values(values)
    }

    /// 15 slots: key flags of the last 5 snapshots, oldest first
    fn key_block(&self, input: &InputHistory, out: &mut Vec<f32>) {
        let recent = input.recent(RECENT_WINDOW);
        for i in 0..RECENT_WINDOW {
            match recent.get(i) {
                Some(snap) => {
                    out.push(flag(snap.vertical()));
                    out.push(flag(snap.horizontal()));
                    out.push(flag(snap.vertical() && snap.horizontal()));
                }
                None => out.extend_from_slice(&[0.0; 3]),
            }
        }
    }

    /// 20 slots: normalized velocity and acceleration of the last 5 samples
    fn kinematic_block(&self, motion: &MotionHistory, out: &mut Vec<f32>) {
        let recent = motion.recent(RECENT_WINDOW);
        let v = self.config.velocity_scale.max(f32::EPSILON);
        let a = self.config.acceleration_scale.max(f32::EPSILON);

        for i in 0..RECENT_WINDOW {
            match recent.get(i) {
                Some(s) => {
                    out.push(unit(s.vx / v));
                    out.push(unit(s.vy / v));
                    out.push(unit(s.ax / a));
                    out.push(unit(s.ay / a));
                }
                None => out.extend_from_slice(&[0.0; 4]),
            }
        }
    }

    /// 10 slots: statistics over the whole motion buffer
    fn summary_block(&self, motion: &MotionHistory, agent: &AgentState, out: &mut Vec<f32>) {
        if motion.len() < SUMMARY_MIN_SAMPLES {
            out.extend_from_slice(&[0.0; 10]);
            return;
        }

        let v = self.config.velocity_scale.max(f32::EPSILON);
        let n = motion.len() as f32;

        let mean_vx = motion.iter().map(|s| s.vx).sum::<f32>() / n;
        let mean_vy = motion.iter().map(|s| s.vy).sum::<f32>() / n;
        let var_vx = motion.iter().map(|s| (s.vx - mean_vx).powi(2)).sum::<f32>() / n;
        let var_vy = motion.iter().map(|s| (s.vy - mean_vy).powi(2)).sum::<f32>() / n;

        let turns = heading_changes(motion.iter());
        let mean_turn = if turns.is_empty() {
            0.0
        } else {
            turns.iter().sum::<f32>() / turns.len() as f32
        };

        let latest_speed = motion.latest().map(|s| s.speed).unwrap_or(0.0);

        out.push(unit(mean_vx / v));
        out.push(unit(mean_vy / v));
        out.push(unit(var_vx / (v * v)));
        out.push(unit(var_vy / (v * v)));
        out.push(unit(mean_turn / std::f32::consts::PI));
        out.push(unit(latest_speed / v));
        out.push(unit(agent.average_speed / v));
        out.push(unit(
            agent.direction_change_count as f32 / self.config.direction_change_scale.max(1.0),
        ));
        out.push(agent.pattern_confidence.clamp(0.0, 1.0));
        out.push(agent.health_fraction());
    }

    /// 5 slots: mean hold per direction key and key-press frequency
    fn habit_block(&self, input: &InputHistory, out: &mut Vec<f32>) {
        if input.len() < HABITS_MIN_SNAPSHOTS {
            out.extend_from_slice(&[0.0; 5]);
            return;
        }

        let n = input.len() as f32;
        let scale = self.config.held_scale_ms.max(f32::EPSILON);
        for key in DirectionKey::ALL {
            let mean_held = input.iter().map(|s| s.held(key)).sum::<f32>() / n;
            out.push((mean_held / scale).clamp(0.0, 1.0));
        }

        let snaps: Vec<_> = input.iter().collect();
        let presses = snaps
            .windows(2)
            .filter(|w| w[1].new_press_since(w[0]))
            .count();
        out.push(presses as f32 / (snaps.len() - 1) as f32);
    }
}

fn flag(b: bool) -> f32 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn unit(v: f32) -> f32 {
    if v.is_finite() {
        v.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

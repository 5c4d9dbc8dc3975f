//! # Motion - What the Mover Tells Us
//!
//! Plain records produced by the surrounding simulation once per tick.
//! The engine never mutates a sample after it has been recorded.

use serde::{Deserialize, Serialize};
use std::f32::consts::{PI, TAU};
use std::fmt;

use crate::PATTERN_CLASSES;

/// A point or displacement in world space (pixels)
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn length(&self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    pub fn distance(&self, other: Vec2) -> f32 {
        (*self - other).length()
    }

    pub fn scale(&self, factor: f32) -> Vec2 {
        Vec2::new(self.x * factor, self.y * factor)
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl std::ops::Add for Vec2 {
    type Output = Vec2;

    fn add(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl std::ops::Sub for Vec2 {
    type Output = Vec2;

    fn sub(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

/// Wrap an angle into (-π, π]
pub fn wrap_angle(angle: f32) -> f32 {
    let wrapped = (angle + PI).rem_euclid(TAU) - PI;
    if wrapped <= -PI {
        wrapped + TAU
    } else {
        wrapped
    }
}

/// Signed smallest rotation taking `from` to `to`, in (-π, π]
pub fn angle_delta(from: f32, to: f32) -> f32 {
    wrap_angle(to - from)
}

/// Wrapped heading changes between consecutive samples that have a heading
pub fn heading_changes<'a>(samples: impl IntoIterator<Item = &'a MotionSample>) -> Vec<f32> {
    let headings: Vec<f32> = samples
        .into_iter()
        .filter(|s| s.has_heading())
        .map(|s| s.direction)
        .collect();
    headings.windows(2).map(|w| angle_delta(w[0], w[1])).collect()
}

// ============================================================================
// PATTERN
// ============================================================================

/// Coarse label for recent movement style
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Pattern {
    #[default]
    Random,
    Circular,
    Zigzag,
    Strafe,
    Straight,
}

impl Pattern {
    /// All patterns, in one-hot index order
    pub const ALL: [Pattern; PATTERN_CLASSES] = [
        Pattern::Random,
        Pattern::Circular,
        Pattern::Zigzag,
        Pattern::Strafe,
        Pattern::Straight,
    ];

    pub fn index(self) -> usize {
        match self {
            Pattern::Random => 0,
            Pattern::Circular => 1,
            Pattern::Zigzag => 2,
            Pattern::Strafe => 3,
            Pattern::Straight => 4,
        }
    }

    pub fn from_index(index: usize) -> Option<Pattern> {
        Self::ALL.get(index).copied()
    }

    /// One-hot encoding over the five classes
    pub fn one_hot(self) -> [f32; PATTERN_CLASSES] {
        let mut encoded = [0.0; PATTERN_CLASSES];
        encoded[self.index()] = 1.0;
        encoded
    }

    pub fn name(self) -> &'static str {
        match self {
            Pattern::Random => "random",
            Pattern::Circular => "circular",
            Pattern::Zigzag => "zigzag",
            Pattern::Strafe => "strafe",
            Pattern::Straight => "straight",
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// SAMPLES
// ============================================================================

/// Kinematic snapshot of the mover at one tick
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MotionSample {
    pub x: f32,
    pub y: f32,
    /// Velocity (px/frame)
    pub vx: f32,
    pub vy: f32,
    /// Acceleration (px/frame²)
    pub ax: f32,
    pub ay: f32,
    /// Magnitude of velocity
    pub speed: f32,
    /// Heading in radians, (-π, π]
    pub direction: f32,
    /// Logical time the sample was taken
    pub timestamp: u64,
}

impl MotionSample {
    pub fn position(&self) -> Vec2 {
        Vec2::new(self.x, self.y)
    }

    pub fn velocity(&self) -> Vec2 {
        Vec2::new(self.vx, self.vy)
    }

    /// Whether `direction` was measured. The first sample of a history and
    /// samples taken at rest carry no heading of their own.
    pub fn has_heading(&self) -> bool {
        self.speed > f32::EPSILON
    }

    /// Derive a sample from the previous one and a new position.
    ///
    /// Velocity and acceleration are per-frame differences; a stationary
    /// mover keeps its previous heading.
    pub fn follow(previous: Option<&MotionSample>, x: f32, y: f32, timestamp: u64) -> Self {
        let Some(prev) = previous else {
            return Self {
                x,
                y,
                timestamp,
                ..Self::default()
            };
        };

        let vx = x - prev.x;
        let vy = y - prev.y;
        let speed = (vx * vx + vy * vy).sqrt();
        let direction = if speed > f32::EPSILON {
            vy.atan2(vx)
        } else {
            prev.direction
        };

        Self {
            x,
            y,
            vx,
            vy,
            ax: vx - prev.vx,
            ay: vy - prev.vy,
            speed,
            direction,
            timestamp,
        }
    }
}

/// The four movement keys
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DirectionKey {
    Up,
    Down,
    Left,
    Right,
}

impl DirectionKey {
    pub const ALL: [DirectionKey; 4] = [
        DirectionKey::Up,
        DirectionKey::Down,
        DirectionKey::Left,
        DirectionKey::Right,
    ];

    pub fn index(self) -> usize {
        match self {
            DirectionKey::Up => 0,
            DirectionKey::Down => 1,
            DirectionKey::Left => 2,
            DirectionKey::Right => 3,
        }
    }
}

/// Which movement keys were held at one tick, and for how long
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSnapshot {
    /// Pressed flags indexed by `DirectionKey::index`
    pub pressed: [bool; 4],
    /// Milliseconds each key has been held (0 when released)
    pub held_ms: [f32; 4],
    pub timestamp: u64,
}

impl InputSnapshot {
    pub fn new(keys: &[DirectionKey], timestamp: u64) -> Self {
        let mut snapshot = Self {
            timestamp,
            ..Self::default()
        };
        for key in keys {
            snapshot.pressed[key.index()] = true;
        }
        snapshot
    }

    pub fn is_pressed(&self, key: DirectionKey) -> bool {
        self.pressed[key.index()]
    }

    pub fn held(&self, key: DirectionKey) -> f32 {
        self.held_ms[key.index()]
    }

    pub fn vertical(&self) -> bool {
        self.is_pressed(DirectionKey::Up) || self.is_pressed(DirectionKey::Down)
    }

    pub fn horizontal(&self) -> bool {
        self.is_pressed(DirectionKey::Left) || self.is_pressed(DirectionKey::Right)
    }

    pub fn any(&self) -> bool {
        self.pressed.iter().any(|p| *p)
    }

    /// True if any key is down now that was up in `previous`
    pub fn new_press_since(&self, previous: &InputSnapshot) -> bool {
        self.pressed
            .iter()
            .zip(previous.pressed.iter())
            .any(|(now, before)| *now && !*before)
    }
}

// ============================================================================
// AGENT STATE
// ============================================================================

/// State of the tracked mover, owned by the surrounding simulation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub position: Vec2,
    pub health: f32,
    pub max_health: f32,
    /// Mean speed over the last classified window
    pub average_speed: f32,
    /// Inter-frame heading changes above 45° in the last classified window
    pub direction_change_count: u32,
    pub current_pattern: Pattern,
    /// Confidence in `current_pattern`, [0, 1]
    pub pattern_confidence: f32,
}

impl Default for AgentState {
    fn default() -> Self {
        Self {
            position: Vec2::ZERO,
            health: 100.0,
            max_health: 100.0,
            average_speed: 0.0,
            direction_change_count: 0,
            current_pattern: Pattern::Random,
            pattern_confidence: 0.0,
        }
    }
}

impl AgentState {
    pub fn at(position: Vec2) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    /// Health in [0, 1]
    pub fn health_fraction(&self) -> f32 {
        if self.max_health <= f32::EPSILON {
            return 0.0;
        }
        (self.health / self.max_health).clamp(0.0, 1.0)
    }
}

//! # ORACLE Core
//!
//! Core types for ORACLE - Online Recognition And Classification of
//! Locomotion Events.
//!
//! This crate provides the data the prediction engine consumes:
//! - **Motion**: per-tick kinematic samples and key-input snapshots
//! - **History**: bounded ring buffers that keep only the recent past
//! - **Features**: the fixed-length vector every model is fed
//! - **Config**: every tunable threshold, loadable from JSON or env
//!
//! ## Data Flow
//!
//! ```text
//! mover ──► MotionHistory / InputHistory ──► FeatureExtractor ──► models
//!                 ▲                                              │
//!                 └────────── realized outcomes ◄────────────────┘
//! ```
//!
//! Nothing here allocates per frame beyond the feature vector itself, and
//! nothing here can fail: short histories degrade to zero-filled slots.

pub mod config;
pub mod error;
pub mod features;
pub mod history;
pub mod motion;
pub mod traits;

// Re-export main types at crate root
pub use config::OracleConfig;
pub use error::{OracleError, OracleResult};
pub use features::{FeatureExtractor, FeatureVector};
pub use history::{HistoryBuffer, InputHistory, MotionHistory};
pub use motion::{AgentState, DirectionKey, InputSnapshot, MotionSample, Pattern, Vec2};
pub use traits::{Clock, LogicalClock, SystemClock};

/// Format version of persisted engine state
pub const ENGINE_FORMAT_VERSION: u32 = 1;

/// Length of every feature vector
pub const FEATURE_DIMS: usize = 50;

/// Number of movement pattern classes
pub const PATTERN_CLASSES: usize = 5;

/// Capacity of the motion sample ring buffer
pub const MOTION_HISTORY_CAPACITY: usize = 30;

/// Default capacity of the input snapshot ring buffer
pub const INPUT_HISTORY_CAPACITY: usize = 30;

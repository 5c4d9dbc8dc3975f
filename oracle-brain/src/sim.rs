//! # Sim - Synthetic Mover for the Demo Loop
//!
//! Stands in for the host game: a mover that cycles through scripted
//! movement styles, and a `Simulation` that feeds its frames to a
//! predictor the way a game tick would.
//!
//! Each tick:
//! 1. step the mover and append to the histories
//! 2. score last tick's forecast against where the mover actually went
//! 3. feed last tick's state and this tick's outcome back as training data
//! 4. classify, then forecast the next frame

use std::f32::consts::{FRAC_PI_2, FRAC_PI_4, TAU};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use oracle_core::{
    AgentState, Clock, DirectionKey, HistoryBuffer, InputHistory, LogicalClock, MotionHistory,
    OracleConfig, OracleResult, Pattern, Vec2,
};

use crate::predictor::{MovementPredictor, Observation, PatternPrediction, PositionPrediction};

/// Styles the mover cycles through
const SCRIPT: [Pattern; 4] = [
    Pattern::Circular,
    Pattern::Zigzag,
    Pattern::Straight,
    Pattern::Strafe,
];

/// Hit tolerance for one-frame forecasts, in pixels
pub const HIT_TOLERANCE_PX: f32 = 5.0;

/// One frame of mover output
#[derive(Clone, Debug, PartialEq)]
pub struct MoverFrame {
    pub position: Vec2,
    pub velocity: Vec2,
    pub keys: Vec<DirectionKey>,
    pub pattern: Pattern,
}

/// Scripted mover with a little positional jitter
#[derive(Debug)]
pub struct SyntheticMover {
    script: Vec<Pattern>,
    position: Vec2,
    heading: f32,
    frame: u64,
    segment_frames: u64,
    rng: StdRng,
}

impl SyntheticMover {
    pub fn new(seed: u64, segment_frames: u64) -> Self {
        Self::scripted(seed, segment_frames, &SCRIPT)
    }

    /// Mover cycling through `script` instead of the default styles
    pub fn scripted(seed: u64, segment_frames: u64, script: &[Pattern]) -> Self {
        let script = if script.is_empty() { SCRIPT.to_vec() } else { script.to_vec() };
        Self {
            script,
            position: Vec2::new(400.0, 300.0),
            heading: 0.0,
            frame: 0,
            segment_frames: segment_frames.max(1),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Style scripted for the current frame
    pub fn pattern(&self) -> Pattern {
        self.script[((self.frame / self.segment_frames) % self.script.len() as u64) as usize]
    }

    pub fn step(&mut self) -> MoverFrame {
        let pattern = self.pattern();
        let local = self.frame % self.segment_frames;
        if local == 0 {
            self.heading = self.rng.gen_range(0.0..TAU);
        }

        let (speed, direction): (f32, f32) = match pattern {
            // radius = speed / turn rate = 40 px
            Pattern::Circular => {
                self.heading += 0.15;
                (6.0, self.heading)
            }
            Pattern::Zigzag => {
                let side = if (local / 3) % 2 == 0 { FRAC_PI_4 } else { -FRAC_PI_4 };
                (4.0, self.heading + side)
            }
            Pattern::Straight => (4.0, self.heading),
            // Held heading, speed pulsing every two frames
            Pattern::Strafe => {
                let speed = if (local / 2) % 2 == 0 { 3.6 } else { 2.4 };
                (speed, self.heading + FRAC_PI_2)
            }
            Pattern::Random => (self.rng.gen_range(0.0..4.0), self.rng.gen_range(0.0..TAU)),
        };

        let jitter = Vec2::new(self.rng.gen_range(-0.1..0.1), self.rng.gen_range(-0.1..0.1));
        let velocity = Vec2::new(direction.cos() * speed, direction.sin() * speed);
        self.position = self.position + velocity + jitter;
        self.frame += 1;

        MoverFrame {
            position: self.position,
            velocity,
            keys: keys_for(velocity),
            pattern,
        }
    }
}

/// Keys a player would hold to produce `velocity` (screen y grows down)
fn keys_for(velocity: Vec2) -> Vec<DirectionKey> {
    let mut keys = Vec::new();
    if velocity.y < -0.5 {
        keys.push(DirectionKey::Up);
    } else if velocity.y > 0.5 {
        keys.push(DirectionKey::Down);
    }
    if velocity.x < -0.5 {
        keys.push(DirectionKey::Left);
    } else if velocity.x > 0.5 {
        keys.push(DirectionKey::Right);
    }
    keys
}

/// What happened in one tick
#[derive(Clone, Debug)]
pub struct TickReport {
    pub frame: MoverFrame,
    pub prediction: PositionPrediction,
    pub pattern: PatternPrediction,
    /// Whether last tick's forecast landed within tolerance
    pub hit: Option<bool>,
    pub training_started: bool,
}

struct Previous {
    input: InputHistory,
    motion: MotionHistory,
    agent: AgentState,
    prediction: PositionPrediction,
    pattern: Pattern,
}

/// Host-side tick loop around a predictor
pub struct Simulation {
    mover: SyntheticMover,
    clock: Arc<LogicalClock>,
    frame_ms: u64,
    input: InputHistory,
    motion: MotionHistory,
    agent: AgentState,
    previous: Option<Previous>,
}

impl Simulation {
    pub fn new(config: &OracleConfig, mover: SyntheticMover, clock: Arc<LogicalClock>) -> Self {
        Self {
            mover,
            clock,
            frame_ms: (1000.0 / config.ensemble.frame_rate).round().max(1.0) as u64,
            input: HistoryBuffer::new(config.history.input_capacity),
            motion: HistoryBuffer::new(config.history.motion_capacity),
            agent: AgentState::default(),
            previous: None,
        }
    }

    pub fn agent(&self) -> &AgentState {
        &self.agent
    }

    pub fn tick(&mut self, predictor: &mut MovementPredictor) -> OracleResult<TickReport> {
        let now = self.clock.advance(self.frame_ms);
        let frame = self.mover.step();

        self.input.record_keys(&frame.keys, now);
        let sample = self.motion.record_position(frame.position.x, frame.position.y, now);

        let mut hit = None;
        let mut training_started = false;
        if let Some(prev) = self.previous.take() {
            hit = Some(predictor.update_accuracy(
                prev.prediction.position,
                frame.position,
                HIT_TOLERANCE_PX,
            ));
            predictor.update_pattern_accuracy(prev.pattern, frame.pattern);

            let outcome = Observation {
                position: frame.position,
                velocity: sample.velocity(),
                pattern: frame.pattern,
            };
            training_started =
                predictor.add_training_data(&prev.input, &prev.motion, &prev.agent, &outcome)?;
        }

        predictor.classify_motion(&self.motion, &mut self.agent);
        self.agent.position = sample.position();

        // The fused position is already the next-frame forecast
        let prediction = predictor.predict_position(&self.input, &self.motion, &self.agent, 0.0);
        let pattern = predictor.classify_pattern(&self.input, &self.motion, &self.agent);

        self.previous = Some(Previous {
            input: self.input.clone(),
            motion: self.motion.clone(),
            agent: self.agent.clone(),
            prediction: prediction.clone(),
            pattern: pattern.pattern,
        });

        tracing::trace!(
            "t={} at ({:.1}, {:.1}) -> ({:.1}, {:.1}) {}",
            self.clock.now(),
            frame.position.x,
            frame.position.y,
            prediction.position.x,
            prediction.position.y,
            pattern.pattern
        );

        Ok(TickReport {
            frame,
            prediction,
            pattern,
            hit,
            training_started,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mover_cycles_script() {
        let mut mover = SyntheticMover::new(1, 10);
        let patterns: Vec<Pattern> = (0..40).map(|_| mover.step().pattern).collect();
        assert_eq!(patterns[0], Pattern::Circular);
        assert_eq!(patterns[10], Pattern::Zigzag);
        assert_eq!(patterns[20], Pattern::Straight);
        assert_eq!(patterns[30], Pattern::Strafe);
    }

    #[test]
    fn test_keys_follow_velocity() {
        assert_eq!(keys_for(Vec2::new(3.0, 0.0)), vec![DirectionKey::Right]);
        assert_eq!(
            keys_for(Vec2::new(-3.0, -3.0)),
            vec![DirectionKey::Up, DirectionKey::Left]
        );
        assert!(keys_for(Vec2::ZERO).is_empty());
    }

    fn classify_scripted(pattern: Pattern, frames: u64) -> Pattern {
        let classifier = crate::classifier::PatternClassifier::default();
        let mut mover = SyntheticMover::scripted(5, 1_000, &[pattern]);
        let mut motion = MotionHistory::default();
        for t in 0..frames {
            let frame = mover.step();
            motion.record_position(frame.position.x, frame.position.y, t * 16);
        }
        classifier.classify(&motion, &mut AgentState::default()).pattern
    }

    #[test]
    fn test_scripted_styles_are_recognized() {
        assert_eq!(classify_scripted(Pattern::Strafe, 20), Pattern::Strafe);
        assert_eq!(classify_scripted(Pattern::Straight, 20), Pattern::Straight);
    }

    #[test]
    fn test_knn_forecast_lands_on_next_position() {
        let config = OracleConfig::deterministic(8);
        let clock = Arc::new(LogicalClock::new(0));
        let mut predictor =
            MovementPredictor::with_clock(config.clone(), clock.clone()).unwrap();
        let mover = SyntheticMover::scripted(8, 1_000, &[Pattern::Straight]);
        let mut sim = Simulation::new(&config, mover, clock);

        let mut previous: Option<TickReport> = None;
        for tick in 0..60 {
            let report = sim.tick(&mut predictor).unwrap();
            assert_eq!(report.prediction.horizon, 0.0);
            if let Some(prev) = previous.take() {
                if tick > 20 {
                    let knn = prev
                        .prediction
                        .sources
                        .iter()
                        .find(|s| s.source == crate::ensemble::PredictorSource::Knn)
                        .unwrap();
                    let miss = (knn.position - report.frame.position).length();
                    // One frame of travel is 4 px
                    assert!(miss < 0.5, "tick {tick}: KNN missed by {miss}");
                }
            }
            previous = Some(report);
        }
    }

    #[test]
    fn test_simulation_trains_and_scores() {
        let config = OracleConfig::deterministic(21);
        let clock = Arc::new(LogicalClock::new(0));
        let mut predictor =
            MovementPredictor::with_clock(config.clone(), clock.clone()).unwrap();
        let mut sim = Simulation::new(&config, SyntheticMover::new(21, 60), clock);

        let mut hits = 0;
        for _ in 0..61 {
            let report = sim.tick(&mut predictor).unwrap();
            assert!(report.prediction.position.is_finite());
            if report.hit.is_some() {
                hits += 1;
            }
        }

        assert_eq!(hits, 60);
        // 60 examples at a trigger of 20
        assert_eq!(predictor.training_passes(), 3);
        assert_eq!(predictor.accuracy().position_samples, 60);
    }
}

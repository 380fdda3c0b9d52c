//! Motion reconstruction
//!
//! Turns accepted movement reports back into cursor motion against a
//! [`PointerOutput`]. Two interchangeable policies:
//!
//! - [`DirectApply`] moves the pointer by each report's delta immediately.
//!   Lowest latency, but bursty arrival shows up as visible stutter.
//! - [`Interpolating`] accumulates deltas and drains them toward the
//!   pointer at a fixed tick using exponential smoothing. A small fixed
//!   latency in exchange for hiding burst and jitter in arrival timing.
//!
//! Reports use "positive dy = down" while the output coordinate space
//! grows upward, so both policies invert the vertical axis on apply.

use crate::{ButtonFlags, MotionReport, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Default smoothing factor for the interpolating policy
pub const DEFAULT_ALPHA: f64 = 0.2;

/// Below this velocity magnitude the interpolating policy holds still
pub const DEFAULT_EPSILON: f64 = 0.01;

/// Default interpolation tick rate
pub const DEFAULT_TICK_HZ: f64 = 120.0;

/// Destination for reconstructed motion
///
/// Buttons and scroll are pass-through extension points; implementations
/// that only move the cursor can leave the default no-ops in place.
pub trait PointerOutput: Send + Sync {
    /// Move the pointer to an absolute position
    fn move_to(&self, x: f64, y: f64) -> Result<()>;

    /// Forward button state unchanged
    fn buttons(&self, _flags: ButtonFlags) -> Result<()> {
        Ok(())
    }

    /// Forward a scroll step unchanged
    fn scroll(&self, _amount: i8) -> Result<()> {
        Ok(())
    }
}

/// Rectangular output bounds, inclusive on both edges
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenBounds {
    pub width: f64,
    pub height: f64,
}

impl ScreenBounds {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn clamp(&self, x: f64, y: f64) -> (f64, f64) {
        (x.clamp(0.0, self.width), y.clamp(0.0, self.height))
    }
}

/// A reconstruction policy consuming accepted reports
pub trait MotionPolicy: Send + Sync {
    fn apply(&self, report: &MotionReport) -> Result<()>;

    /// Current output position (for status display)
    fn position(&self) -> (f64, f64);
}

/// Immediate, undamped application of each report's delta
pub struct DirectApply {
    output: Arc<dyn PointerOutput>,
    bounds: ScreenBounds,
    position: Mutex<(f64, f64)>,
}

impl DirectApply {
    pub fn new(output: Arc<dyn PointerOutput>, bounds: ScreenBounds, start: (f64, f64)) -> Self {
        Self {
            output,
            bounds,
            position: Mutex::new(start),
        }
    }
}

impl MotionPolicy for DirectApply {
    fn apply(&self, report: &MotionReport) -> Result<()> {
        let mut position = self.position.lock().unwrap();
        let (x, y) = self.bounds.clamp(
            position.0 + report.dx as f64,
            position.1 - report.dy as f64,
        );
        *position = (x, y);
        drop(position);

        self.output.move_to(x, y)?;
        self.output.buttons(report.buttons)?;
        if report.scroll != 0 {
            self.output.scroll(report.scroll)?;
        }
        Ok(())
    }

    fn position(&self) -> (f64, f64) {
        *self.position.lock().unwrap()
    }
}

/// Tunables for the interpolating policy
#[derive(Debug, Clone, Copy)]
pub struct InterpolatingConfig {
    /// Exponential smoothing factor in (0, 1]
    pub alpha: f64,
    /// Velocity magnitude below which the pointer holds still
    pub epsilon: f64,
    /// Tick frequency for the drain loop
    pub tick_hz: f64,
}

impl Default for InterpolatingConfig {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            epsilon: DEFAULT_EPSILON,
            tick_hz: DEFAULT_TICK_HZ,
        }
    }
}

impl InterpolatingConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_hz)
    }
}

#[derive(Debug, Default)]
struct InterpolatingState {
    accum_x: f64,
    accum_y: f64,
    velocity_x: f64,
    velocity_y: f64,
    pos_x: f64,
    pos_y: f64,
}

/// Accumulate-and-interpolate reconstruction
///
/// Reports land in a mutex-protected accumulator; [`Interpolating::tick`]
/// drains it with `velocity = velocity*(1-alpha) + accumulated*alpha`
/// and subtracts what was applied, so the accumulator stays bounded for
/// any input rate the tick can keep up with. `tick` is synchronous so
/// the drain behavior is deterministic under test; [`Interpolating::spawn_ticker`]
/// runs it on the configured interval.
pub struct Interpolating {
    output: Arc<dyn PointerOutput>,
    bounds: ScreenBounds,
    config: InterpolatingConfig,
    state: Mutex<InterpolatingState>,
}

impl Interpolating {
    pub fn new(
        output: Arc<dyn PointerOutput>,
        bounds: ScreenBounds,
        config: InterpolatingConfig,
        start: (f64, f64),
    ) -> Self {
        Self {
            output,
            bounds,
            config,
            state: Mutex::new(InterpolatingState {
                pos_x: start.0,
                pos_y: start.1,
                ..Default::default()
            }),
        }
    }

    /// One drain step. Applies the smoothed velocity to the pointer when
    /// it exceeds epsilon and removes the applied amount from the
    /// accumulator.
    pub fn tick(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let alpha = self.config.alpha;

        state.velocity_x = state.velocity_x * (1.0 - alpha) + state.accum_x * alpha;
        state.velocity_y = state.velocity_y * (1.0 - alpha) + state.accum_y * alpha;

        let magnitude = state.velocity_x.hypot(state.velocity_y);
        if magnitude <= self.config.epsilon {
            return Ok(());
        }

        let (vx, vy) = (state.velocity_x, state.velocity_y);
        let (x, y) = self.bounds.clamp(state.pos_x + vx, state.pos_y - vy);
        state.pos_x = x;
        state.pos_y = y;
        state.accum_x -= vx;
        state.accum_y -= vy;
        drop(state);

        self.output.move_to(x, y)
    }

    /// Run the tick on its configured interval until aborted
    pub fn spawn_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let policy = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(policy.config.tick_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if let Err(e) = policy.tick() {
                    debug!("interpolation tick failed: {}", e);
                }
            }
        })
    }

    /// Residual accumulator contents (for diagnostics)
    pub fn accumulated(&self) -> (f64, f64) {
        let state = self.state.lock().unwrap();
        (state.accum_x, state.accum_y)
    }
}

impl MotionPolicy for Interpolating {
    /// Buttons and scroll bypass smoothing; only movement is damped.
    fn apply(&self, report: &MotionReport) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            state.accum_x += report.dx as f64;
            state.accum_y += report.dy as f64;
        }

        self.output.buttons(report.buttons)?;
        if report.scroll != 0 {
            self.output.scroll(report.scroll)?;
        }
        Ok(())
    }

    fn position(&self) -> (f64, f64) {
        let state = self.state.lock().unwrap();
        (state.pos_x, state.pos_y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingOutput {
        moves: Mutex<Vec<(f64, f64)>>,
    }

    impl PointerOutput for RecordingOutput {
        fn move_to(&self, x: f64, y: f64) -> Result<()> {
            self.moves.lock().unwrap().push((x, y));
            Ok(())
        }
    }

    fn report(dx: i16, dy: i16) -> MotionReport {
        MotionReport::new(ButtonFlags::default(), dx, dy, 0)
    }

    #[test]
    fn test_direct_apply_inverts_y() {
        let output = Arc::new(RecordingOutput::default());
        let policy = DirectApply::new(output.clone(), ScreenBounds::new(500.0, 500.0), (100.0, 100.0));

        policy.apply(&report(10, -5)).unwrap();
        assert_eq!(policy.position(), (110.0, 105.0));
        assert_eq!(output.moves.lock().unwrap().as_slice(), &[(110.0, 105.0)]);
    }

    #[test]
    fn test_direct_apply_clamps_to_bounds() {
        let output = Arc::new(RecordingOutput::default());
        let policy = DirectApply::new(output, ScreenBounds::new(1920.0, 1080.0), (1919.0, 0.0));

        policy.apply(&report(50, 0)).unwrap();
        assert_eq!(policy.position(), (1920.0, 0.0));

        policy.apply(&report(0, 10)).unwrap();
        assert_eq!(policy.position(), (1920.0, 0.0));
    }

    #[test]
    fn test_interpolating_accumulator_stays_bounded() {
        let output = Arc::new(RecordingOutput::default());
        let policy = Interpolating::new(
            output.clone(),
            ScreenBounds::new(10000.0, 10000.0),
            InterpolatingConfig::default(),
            (0.0, 0.0),
        );

        let mut last_x = 0.0;
        for _ in 0..1000 {
            policy.apply(&report(1, 0)).unwrap();
            policy.tick().unwrap();

            let (x, _) = policy.position();
            assert!(x >= last_x, "x must advance monotonically");
            last_x = x;

            let (ax, ay) = policy.accumulated();
            assert!(ax.hypot(ay) < 10.0, "accumulator diverged: ({}, {})", ax, ay);
        }

        // velocity converges on the input rate, so most of the stream
        // has been drained to the pointer by now
        assert!(last_x > 900.0);
    }

    #[test]
    fn test_interpolating_holds_still_below_epsilon() {
        let output = Arc::new(RecordingOutput::default());
        let policy = Interpolating::new(
            output.clone(),
            ScreenBounds::new(1000.0, 1000.0),
            InterpolatingConfig::default(),
            (500.0, 500.0),
        );

        for _ in 0..20 {
            policy.tick().unwrap();
        }
        assert!(output.moves.lock().unwrap().is_empty());
        assert_eq!(policy.position(), (500.0, 500.0));
    }

    #[test]
    fn test_interpolating_settles_after_burst() {
        let output = Arc::new(RecordingOutput::default());
        let policy = Interpolating::new(
            output,
            ScreenBounds::new(1000.0, 1000.0),
            InterpolatingConfig::default(),
            (0.0, 500.0),
        );

        policy.apply(&report(40, 20)).unwrap();
        for _ in 0..200 {
            policy.tick().unwrap();
        }

        let (x, y) = policy.position();
        assert!((x - 40.0).abs() < 1.0, "x settled at {}", x);
        assert!((y - 480.0).abs() < 1.0, "y settled at {}", y);
    }
}

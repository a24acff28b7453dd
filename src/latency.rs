//! Latency tracking and the resampling-ratio controller.
//!
//! The producer measures how far ahead of the device playhead it is writing
//! (the *offset*) and steers it toward a target latency by nudging the
//! resampling ratio. The raw offset moves violently at startup and around
//! period changes, so it runs through the producer PLL's second-order filter
//! before feeding a PI controller.

use std::collections::VecDeque;

const KP: f64 = 0.5e-6;
const KI: f64 = 1.0e-16;

/// Jitter headroom multiplier applied to the largest device period.
const PERIOD_HEADROOM: f64 = 1.1;

/// PI controller converting filtered offset error into a resampling ratio.
#[derive(Debug, Default)]
pub struct LatencyController {
    offset_error: f64,
    offset_error_integral: f64,
    ratio_integral: f64,
}

impl LatencyController {
    /// Create a controller with cleared state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all state. Done whenever a slew makes the position history
    /// meaningless.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Filtered offset error in frames. Positive means the producer is
    /// behind the target latency and playback should slow down.
    pub fn offset_error(&self) -> f64 {
        self.offset_error
    }

    /// Advance the controller by one producer period and return the
    /// resampling ratio to use for it.
    ///
    /// `actual_offset_error` is `None` until the device clock has been
    /// observed; the controller then free-runs on its last filtered value.
    /// `b`, `c` and `period_sec` come from the producer's clock tracker, so
    /// the offset filter tracks the same bandwidth as the phase loop.
    pub fn update(
        &mut self,
        actual_offset_error: Option<f64>,
        b: f64,
        c: f64,
        period_sec: f64,
    ) -> f64 {
        // The ratio uses the error as filtered up to the previous period;
        // this period's measurement only lands in the state for the next.
        let offset_error = self.offset_error;

        if let Some(actual) = actual_offset_error {
            let error = actual - offset_error;
            self.offset_error += b * error + self.offset_error_integral;
            self.offset_error_integral += c * error;
        }

        self.ratio_integral += offset_error * period_sec;
        1.0 + KP * offset_error + KI * self.ratio_integral
    }
}

/// Desired steady-state offset between producer and device positions.
///
/// The base is the largest period the device may request, padded for jitter,
/// plus the configured extra buffer. While the device runs at a period
/// *below* its maximum, the difference is added on top: the downshift
/// transition parks extra data in the sample ring, and without raising the
/// target the controller would drain it and then underrun hard when the
/// period size comes back up.
pub fn target_latency_frames(
    device_max_period_frames: usize,
    observed_period_frames: usize,
    buffer_latency_ms: u32,
    sample_rate: u32,
) -> f64 {
    let max_period = device_max_period_frames.max(observed_period_frames);
    let mut target = max_period as f64 * PERIOD_HEADROOM
        + buffer_latency_ms as f64 * sample_rate as f64 / 1000.0;
    if observed_period_frames != 0 && observed_period_frames < device_max_period_frames {
        target += (device_max_period_frames - observed_period_frames) as f64;
    }
    target
}

/// Bounded window of recent total-latency samples, fed once per guest packet
/// and snapshotted for diagnostics.
#[derive(Debug)]
pub struct LatencyWindow {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl LatencyWindow {
    /// Create a window holding up to `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a latency sample in milliseconds.
    pub fn push(&mut self, latency_ms: f32) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    /// Most recent sample, if any.
    pub fn latest(&self) -> Option<f32> {
        self.samples.back().copied()
    }

    /// Copy of the window, oldest first.
    pub fn snapshot(&self) -> Vec<f32> {
        self.samples.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Producer PLL coefficients for a 10 ms period at the 0.05 Hz bandwidth.
    fn coefficients() -> (f64, f64, f64) {
        let period_sec = 0.01;
        let omega = 2.0 * std::f64::consts::PI * 0.05 * period_sec;
        (std::f64::consts::SQRT_2 * omega, omega * omega, period_sec)
    }

    #[test]
    fn ratio_rises_when_behind_target() {
        let (b, c, period) = coefficients();
        let mut controller = LatencyController::new();

        let mut ratio = 1.0;
        for _ in 0..200 {
            // Producer 500 frames short of target: positive offset error.
            ratio = controller.update(Some(500.0), b, c, period);
        }
        assert!(controller.offset_error() > 0.0);
        assert!(ratio > 1.0);
        assert!(ratio < 1.001, "correction should stay gentle: {ratio}");
    }

    #[test]
    fn ratio_falls_when_ahead_of_target() {
        let (b, c, period) = coefficients();
        let mut controller = LatencyController::new();
        let mut ratio = 1.0;
        for _ in 0..200 {
            ratio = controller.update(Some(-500.0), b, c, period);
        }
        assert!(ratio < 1.0);
    }

    #[test]
    fn ratio_uses_previous_filtered_error() {
        let (b, c, period) = coefficients();
        let mut controller = LatencyController::new();
        // First measurement cannot influence its own period's ratio.
        let ratio = controller.update(Some(1000.0), b, c, period);
        assert_eq!(ratio, 1.0);
        let ratio = controller.update(Some(1000.0), b, c, period);
        assert!(ratio > 1.0);
    }

    #[test]
    fn free_runs_without_device_clock() {
        let (b, c, period) = coefficients();
        let mut controller = LatencyController::new();
        for _ in 0..10 {
            let ratio = controller.update(None, b, c, period);
            assert_eq!(ratio, 1.0);
        }
        assert_eq!(controller.offset_error(), 0.0);
    }

    #[test]
    fn reset_clears_state() {
        let (b, c, period) = coefficients();
        let mut controller = LatencyController::new();
        for _ in 0..50 {
            controller.update(Some(300.0), b, c, period);
        }
        assert!(controller.offset_error() != 0.0);
        controller.reset();
        assert_eq!(controller.offset_error(), 0.0);
        assert_eq!(controller.update(None, b, c, period), 1.0);
    }

    #[test]
    fn target_latency_base() {
        // Device at its maximum period: headroom plus configured buffer.
        let target = target_latency_frames(480, 480, 12, 48_000);
        assert!((target - (480.0 * 1.1 + 576.0)).abs() < 1e-9);
    }

    #[test]
    fn target_latency_downshift_correction() {
        // Observed period below the maximum: the difference is added.
        let target = target_latency_frames(1024, 256, 12, 48_000);
        let expected = 1024.0 * 1.1 + 12.0 * 48.0 + (1024.0 - 256.0);
        assert!((target - expected).abs() < 1e-9);
    }

    #[test]
    fn target_latency_before_first_tick() {
        // No observed period yet: no correction term.
        let target = target_latency_frames(1024, 0, 0, 48_000);
        assert!((target - 1024.0 * 1.1).abs() < 1e-9);
    }

    #[test]
    fn window_caps_length() {
        let mut window = LatencyWindow::new(4);
        for i in 0..10 {
            window.push(i as f32);
        }
        assert_eq!(window.snapshot(), vec![6.0, 7.0, 8.0, 9.0]);
        assert_eq!(window.latest(), Some(9.0));
    }
}

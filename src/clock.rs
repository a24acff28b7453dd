//! Clock recovery for the two sides of the pipeline.
//!
//! The device and the guest both run free; neither clock is trusted. Each
//! thread owns a [`ClockTracker`], a second-order phase-locked loop that
//! estimates the true period and phase of its own wakeups from observed
//! arrival times. The producer additionally keeps a [`DeviceWindow`], built
//! from the ticks the consumer publishes, to interpolate where the device
//! playhead is right now.

use crate::ring::ClockTick;

/// Loop bandwidth of the period estimator, in Hz.
pub const PLL_BANDWIDTH_HZ: f64 = 0.05;

/// Phase error beyond which the loop gives up filtering and slews instead.
pub const DESYNC_THRESHOLD_SEC: f64 = 0.2;

/// How a tracker advances its phase prediction across a period-size change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodChangeRule {
    /// Double-buffered device: it requests the new size while the buffer at
    /// the old size is still playing, so the gap to the next wakeup still
    /// reflects the old period.
    OldPeriod,
    /// Free-running packet source: the next packet arrives one new period
    /// out.
    NewPeriod,
}

/// Result of feeding one wakeup into the tracker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// First wakeup after a reset; estimates were seeded.
    Started,
    /// The period size changed; estimates were re-derived.
    PeriodChanged,
    /// Normal tracking update.
    Locked {
        /// Phase error of this wakeup in seconds.
        error_sec: f64,
    },
    /// Phase error exceeded [`DESYNC_THRESHOLD_SEC`]. The tracker did not
    /// update itself; the caller must slew and then call
    /// [`ClockTracker::resync`].
    Desync {
        /// Phase error of this wakeup in seconds.
        error_sec: f64,
    },
}

/// Second-order PLL estimating the period and phase of one thread's wakeups.
#[derive(Debug)]
pub struct ClockTracker {
    sample_rate: u32,
    change_rule: PeriodChangeRule,
    period_frames: usize,
    period_sec: f64,
    next_time_ns: i64,
    next_position: i64,
    b: f64,
    c: f64,
}

impl ClockTracker {
    /// Create an unstarted tracker for a stream at `sample_rate`.
    pub fn new(sample_rate: u32, change_rule: PeriodChangeRule) -> Self {
        Self {
            sample_rate,
            change_rule,
            period_frames: 0,
            period_sec: 0.0,
            next_time_ns: 0,
            next_position: 0,
            b: 0.0,
            c: 0.0,
        }
    }

    /// Whether the tracker has seen its first wakeup.
    pub fn is_started(&self) -> bool {
        self.period_frames != 0
    }

    /// Current period estimate in frames.
    pub fn period_frames(&self) -> usize {
        self.period_frames
    }

    /// Current period estimate in seconds.
    pub fn period_sec(&self) -> f64 {
        self.period_sec
    }

    /// Predicted wall time of the next wakeup.
    pub fn next_time_ns(&self) -> i64 {
        self.next_time_ns
    }

    /// Cumulative frame position at the next wakeup.
    pub fn next_position(&self) -> i64 {
        self.next_position
    }

    /// Proportional filter coefficient, derived from the current period.
    pub fn b(&self) -> f64 {
        self.b
    }

    /// Integral filter coefficient, derived from the current period.
    pub fn c(&self) -> f64 {
        self.c
    }

    /// Phase error a wakeup at `now_ns` would have, in seconds.
    pub fn pending_error_sec(&self, now_ns: i64) -> f64 {
        (now_ns - self.next_time_ns) as f64 * 1.0e-9
    }

    /// Feed one wakeup of `frames` frames arriving at `now_ns`.
    ///
    /// Does not advance the frame position: the two sides advance by
    /// different amounts (pulled frames vs. resampler output), so callers
    /// follow up with [`advance_position`](Self::advance_position).
    pub fn observe(&mut self, now_ns: i64, frames: usize) -> Observation {
        if !self.is_started() {
            self.set_period(frames);
            self.next_time_ns = now_ns + nanos(self.period_sec);
            return Observation::Started;
        }

        if frames != self.period_frames {
            match self.change_rule {
                PeriodChangeRule::OldPeriod => {
                    /* The device asks for the new period size while the
                     * buffer at the old size is still playing, so the
                     * wall-clock gap to the next wakeup still reflects the
                     * old period. Advance by the old estimate before
                     * switching. */
                    self.next_time_ns += nanos(self.period_sec);
                    self.set_period(frames);
                }
                PeriodChangeRule::NewPeriod => {
                    self.set_period(frames);
                    self.next_time_ns += nanos(self.period_sec);
                }
            }
            return Observation::PeriodChanged;
        }

        let error_sec = self.pending_error_sec(now_ns);
        if error_sec.abs() >= DESYNC_THRESHOLD_SEC {
            return Observation::Desync { error_sec };
        }

        self.next_time_ns += nanos(self.b * error_sec + self.period_sec);
        self.period_sec += self.c * error_sec;
        Observation::Locked { error_sec }
    }

    /// Restart the phase estimate after a slew: the period reverts to the
    /// nominal value and the next wakeup is predicted one period from `now`.
    pub fn resync(&mut self, now_ns: i64, frames: usize) {
        self.period_sec = frames as f64 / self.sample_rate as f64;
        self.next_time_ns = now_ns + nanos(self.period_sec);
    }

    /// Advance the cumulative frame position.
    pub fn advance_position(&mut self, frames: i64) {
        self.next_position += frames;
    }

    /// Overwrite the cumulative frame position (slew bookkeeping).
    pub fn set_position(&mut self, position: i64) {
        self.next_position = position;
    }

    fn set_period(&mut self, frames: usize) {
        self.period_frames = frames;
        self.period_sec = frames as f64 / self.sample_rate as f64;
        let omega = 2.0 * std::f64::consts::PI * PLL_BANDWIDTH_HZ * self.period_sec;
        self.b = std::f64::consts::SQRT_2 * omega;
        self.c = omega * omega;
    }
}

fn nanos(sec: f64) -> i64 {
    (sec * 1.0e9).round() as i64
}

/// The producer's view of the device clock: the last two published ticks.
///
/// Ticks arrive through the timing ring and are absorbed in order, so the
/// pair is always a coherent snapshot even though the fields originate on
/// the other thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceWindow {
    period_frames: usize,
    last_time_ns: i64,
    last_position: i64,
    next_time_ns: i64,
    next_position: i64,
    ticks_seen: u32,
}

impl DeviceWindow {
    /// Shift the window forward by one tick.
    pub fn absorb(&mut self, tick: ClockTick) {
        self.last_time_ns = self.next_time_ns;
        self.last_position = self.next_position;
        self.next_time_ns = tick.next_time_ns;
        self.next_position = tick.next_position;
        self.period_frames = tick.period_frames;
        self.ticks_seen = self.ticks_seen.saturating_add(1);
    }

    /// Whether enough ticks arrived to interpolate a position.
    pub fn ready(&self) -> bool {
        self.ticks_seen >= 2
    }

    /// Device period as of the latest tick, or 0 before the first tick.
    pub fn period_frames(&self) -> usize {
        self.period_frames
    }

    /// Interpolated device playhead position at `t_ns`.
    pub fn position_at(&self, t_ns: i64) -> f64 {
        let span = self.next_time_ns - self.last_time_ns;
        if span == 0 {
            return self.next_position as f64;
        }
        let progress = (t_ns - self.last_time_ns) as f64 / span as f64;
        self.last_position as f64 + (self.next_position - self.last_position) as f64 * progress
    }
}

#![deny(missing_docs)]

//! Adaptive audio playback bridge between a guest VM and the host audio
//! server.
//!
//! The engine receives compressed-timing S16 packets from a remote-desktop
//! protocol client and renders them to the host's audio server while
//! continuously estimating the drift between the guest's producer clock and
//! the device's consumer clock. Two independent phase-locked loops track the
//! clocks, a PI controller turns the measured latency error into a
//! sample-rate conversion ratio, and a signed-count ring buffer absorbs
//! startup transients, period-size changes and slews without blocking the
//! realtime thread.
//!
//! The audio server and the protocol client stay outside the crate: the
//! server is reached through [`AudioBackend`](device::AudioBackend), the
//! client pushes packets into [`AudioEngine`](engine::AudioEngine) and
//! receives capture data through [`CaptureSink`](device::CaptureSink).

use std::sync::Once;

/// Clock recovery (per-side PLLs and the device position window).
pub mod clock;
/// External audio server and protocol client boundary.
pub mod device;
/// Stream lifecycle and the two data paths.
pub mod engine;
/// Latency target, PI controller and diagnostics window.
pub mod latency;
/// Sample-rate conversion.
pub mod resample;
/// Lock-free rings and the monotonic clock.
pub mod ring;

#[cfg(test)]
mod tests;

pub use device::{
    channel_gain, AudioBackend, BackendError, CapturePort, CaptureSink, PlaybackSetup,
    SampleFormat,
};
pub use engine::{AudioEngine, DevicePort, EngineStatus, StreamState};
pub use resample::{ResampleError, Resampler, SincResampler};

/// Periodic latency report: `(total_ms, offset_ms, device_ms)`, with
/// `total = offset + device`.
pub type LatencyCallback = Box<dyn Fn(f32, f32, f32) + Send + Sync>;

/// Engine-wide configuration, immutable after construction.
pub struct EngineOpts {
    /// Requested device period in frames. A hint; the device may override.
    pub period_size: usize,
    /// Extra jitter budget added to the target latency, in milliseconds.
    pub buffer_latency_ms: u32,
    /// Playback sink identifier passed to the audio server.
    pub sink: Option<String>,
    /// Capture source identifier passed to the audio server.
    pub source: Option<String>,
    /// Invoked once per few guest packets with the current latency split.
    pub latency_cb: Option<LatencyCallback>,
}

impl Default for EngineOpts {
    fn default() -> Self {
        Self {
            period_size: 256,
            buffer_latency_ms: 12,
            sink: None,
            source: None,
            latency_cb: None,
        }
    }
}

/// Install the default `tracing` subscriber once. Safe to call repeatedly.
pub fn init_tracing() {
    static TRACING_INIT: Once = Once::new();
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}

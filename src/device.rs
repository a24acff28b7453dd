//! Boundary to the external audio server and protocol client.
//!
//! The engine never talks to audio hardware itself. [`AudioBackend`] is the
//! seam the host integration implements: open the playback stream, forward
//! volume and mute, report device latency, and hand the engine's
//! [`DevicePort`](crate::engine::DevicePort) to the server's realtime
//! callback. The capture direction relays raw S16 packets back to the
//! protocol client through [`CaptureSink`].

use std::sync::Arc;

use thiserror::Error;

use crate::engine::DevicePort;

/// Errors surfaced by backend implementations.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The playback stream could not be opened.
    #[error("failed to open playback stream: {0}")]
    PlaybackSetup(String),
    /// The capture stream could not be opened.
    #[error("failed to open capture stream: {0}")]
    CaptureSetup(String),
}

/// Sample encodings the protocol client can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SampleFormat {
    /// Signed 16-bit little-endian interleaved PCM.
    S16,
}

/// What the backend learned while opening the playback stream.
#[derive(Debug, Clone, Copy)]
pub struct PlaybackSetup {
    /// Largest period the device may request. The requested period is a
    /// hint; the server can override it.
    pub max_period_frames: usize,
    /// Frames the device may demand almost immediately after activation.
    pub start_frames: usize,
}

/// Host audio server operations, playback and capture.
///
/// Playback setup receives the [`DevicePort`] the server's realtime thread
/// must pull from; capture start receives the [`CapturePort`] its capture
/// callback pushes into. All other calls originate on the producer thread
/// and may block briefly.
pub trait AudioBackend: Send {
    /// Open (or reuse) the playback stream for the given format. The stream
    /// starts inactive; [`playback_start`](Self::playback_start) activates
    /// it.
    fn playback_setup(
        &mut self,
        sink: Option<&str>,
        channels: usize,
        sample_rate: u32,
        requested_period_frames: usize,
        port: DevicePort,
    ) -> Result<PlaybackSetup, BackendError>;

    /// Activate the playback stream; the server begins pulling.
    fn playback_start(&mut self);

    /// Deactivate the playback stream, draining what is queued.
    fn playback_stop(&mut self);

    /// Apply per-channel linear gains to the playback stream.
    fn playback_set_volume(&mut self, gains: &[f32]);

    /// Mute or unmute the playback stream.
    fn playback_set_mute(&mut self, mute: bool);

    /// Device-side latency in frames: what is queued between the stream and
    /// the speaker right now.
    fn playback_latency_frames(&self) -> u64;

    /// Open and activate the capture stream.
    fn record_start(
        &mut self,
        source: Option<&str>,
        channels: usize,
        sample_rate: u32,
        port: CapturePort,
    ) -> Result<(), BackendError>;

    /// Deactivate the capture stream.
    fn record_stop(&mut self);

    /// Apply per-channel linear gains to the capture stream.
    fn record_set_volume(&mut self, gains: &[f32]);

    /// Mute or unmute the capture stream.
    fn record_set_mute(&mut self, mute: bool);
}

/// Receiver for captured audio, implemented by the protocol client.
pub trait CaptureSink: Send + Sync {
    /// Deliver one capture period of S16LE interleaved bytes.
    fn write_audio(&self, data: &[u8]);
}

/// Handle the backend's capture callback pushes into.
#[derive(Clone)]
pub struct CapturePort {
    sink: Arc<dyn CaptureSink>,
}

impl CapturePort {
    pub(crate) fn new(sink: Arc<dyn CaptureSink>) -> Self {
        Self { sink }
    }

    /// Relay one capture period to the protocol client.
    pub fn push(&self, data: &[u8]) {
        self.sink.write_audio(data);
    }
}

/// Map a protocol volume level to a linear gain.
///
/// The curve is a compatibility constant negotiated with the guest tools;
/// treat the coefficients as opaque.
pub fn channel_gain(level: u16) -> f32 {
    (9.3234e-7 * 1.000211902f64.powi(level as i32) - 0.000172787) as f32
}

/// Convert a slice of protocol volume levels to linear gains.
pub fn channel_gains(levels: &[u16]) -> Vec<f32> {
    levels.iter().map(|&level| channel_gain(level)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn gain_curve_anchors() {
        // Endpoints and midpoint of the compatibility curve. The zero level
        // sits fractionally below zero; that offset is part of the contract.
        let zero = channel_gain(0) as f64;
        assert!((zero + 1.71854e-4).abs() < 1e-8, "gain(0) = {zero}");

        let mid = channel_gain(32768) as f64;
        assert!((mid - 7.9287e-4).abs() < 5e-7, "gain(32768) = {mid}");

        let full = channel_gain(65535) as f64;
        assert!((full - 0.99987).abs() < 5e-4, "gain(65535) = {full}");
    }

    #[test]
    fn gain_curve_is_monotonic() {
        let mut previous = channel_gain(0);
        for level in (0..=65535u32).step_by(257) {
            let gain = channel_gain(level as u16);
            assert!(gain >= previous, "curve dipped at level {level}");
            previous = gain;
        }
        assert!(channel_gain(65535) > channel_gain(65280));
    }

    #[test]
    fn gains_map_per_channel() {
        let gains = channel_gains(&[0, 65535]);
        assert_eq!(gains.len(), 2);
        assert!(gains[0] < gains[1]);
    }

    struct RecordingSink(Mutex<Vec<Vec<u8>>>);

    impl CaptureSink for RecordingSink {
        fn write_audio(&self, data: &[u8]) {
            self.0.lock().expect("sink lock").push(data.to_vec());
        }
    }

    #[test]
    fn capture_port_relays_bytes() {
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let port = CapturePort::new(sink.clone());
        port.push(&[1, 2, 3, 4]);
        port.push(&[5, 6]);
        let seen = sink.0.lock().expect("sink lock");
        assert_eq!(seen.as_slice(), &[vec![1, 2, 3, 4], vec![5, 6]]);
    }
}

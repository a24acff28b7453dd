//! Shared mock backend and signal helpers for the scenario tests.
#![allow(dead_code)]

use std::f32::consts::TAU;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use guestlink_audio::{
    AudioBackend, BackendError, CapturePort, DevicePort, PlaybackSetup,
};

/// Everything the mock backend observed, for assertions.
#[derive(Default)]
pub struct MockCalls {
    pub port: Mutex<Option<DevicePort>>,
    pub capture_port: Mutex<Option<CapturePort>>,
    pub playback_setups: AtomicU32,
    pub playback_starts: AtomicU32,
    pub playback_stops: AtomicU32,
    pub record_starts: AtomicU32,
    pub record_stops: AtomicU32,
    pub volumes: Mutex<Vec<Vec<f32>>>,
    pub mutes: Mutex<Vec<bool>>,
}

impl MockCalls {
    pub fn port(&self) -> DevicePort {
        self.port
            .lock()
            .expect("port lock")
            .clone()
            .expect("backend received a device port")
    }
}

/// Audio backend that records every call and hands the device port back to
/// the test, which drives pulls itself on a synthetic clock.
pub struct MockBackend {
    pub calls: Arc<MockCalls>,
    pub max_period_frames: usize,
    pub start_frames: usize,
    pub latency_frames: u64,
}

impl MockBackend {
    pub fn new(max_period_frames: usize, start_frames: usize) -> (Self, Arc<MockCalls>) {
        let calls = Arc::new(MockCalls::default());
        (
            Self {
                calls: calls.clone(),
                max_period_frames,
                start_frames,
                latency_frames: 0,
            },
            calls,
        )
    }
}

impl AudioBackend for MockBackend {
    fn playback_setup(
        &mut self,
        _sink: Option<&str>,
        _channels: usize,
        _sample_rate: u32,
        _requested_period_frames: usize,
        port: DevicePort,
    ) -> Result<PlaybackSetup, BackendError> {
        self.calls.playback_setups.fetch_add(1, Ordering::Relaxed);
        *self.calls.port.lock().expect("port lock") = Some(port);
        Ok(PlaybackSetup {
            max_period_frames: self.max_period_frames,
            start_frames: self.start_frames,
        })
    }

    fn playback_start(&mut self) {
        self.calls.playback_starts.fetch_add(1, Ordering::Relaxed);
    }

    fn playback_stop(&mut self) {
        self.calls.playback_stops.fetch_add(1, Ordering::Relaxed);
    }

    fn playback_set_volume(&mut self, gains: &[f32]) {
        self.calls
            .volumes
            .lock()
            .expect("volumes lock")
            .push(gains.to_vec());
    }

    fn playback_set_mute(&mut self, mute: bool) {
        self.calls.mutes.lock().expect("mutes lock").push(mute);
    }

    fn playback_latency_frames(&self) -> u64 {
        self.latency_frames
    }

    fn record_start(
        &mut self,
        _source: Option<&str>,
        _channels: usize,
        _sample_rate: u32,
        port: CapturePort,
    ) -> Result<(), BackendError> {
        self.calls.record_starts.fetch_add(1, Ordering::Relaxed);
        *self.calls.capture_port.lock().expect("capture lock") = Some(port);
        Ok(())
    }

    fn record_stop(&mut self) {
        self.calls.record_stops.fetch_add(1, Ordering::Relaxed);
    }

    fn record_set_volume(&mut self, _gains: &[f32]) {}
    fn record_set_mute(&mut self, _mute: bool) {}
}

/// Generate one S16LE packet of a sine tone, advancing `phase_frame`.
pub fn sine_packet(
    frames: usize,
    channels: usize,
    sample_rate: u32,
    frequency_hz: f32,
    phase_frame: &mut u64,
) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(frames * channels * 2);
    for _ in 0..frames {
        let phase = frequency_hz * *phase_frame as f32 / sample_rate as f32;
        let sample = ((phase * TAU).sin() * 0.5 * 32767.0) as i16;
        for _ in 0..channels {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        *phase_frame += 1;
    }
    bytes
}

/// Nanoseconds a period of `frames` frames spans at `sample_rate`.
pub fn period_ns(frames: usize, sample_rate: u32) -> i64 {
    (frames as f64 / sample_rate as f64 * 1.0e9).round() as i64
}

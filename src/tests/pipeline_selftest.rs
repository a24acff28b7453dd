use std::f32::consts::TAU;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::{AudioBackend, BackendError, CapturePort, PlaybackSetup, SampleFormat};
use crate::engine::{AudioEngine, DevicePort, StreamState};
use crate::EngineOpts;

const SAMPLE_RATE: u32 = 48_000;
const CHANNELS: usize = 2;
const PERIOD: usize = 480;
const PERIOD_NS: i64 = 10_000_000;

#[derive(Default)]
struct Hooks {
    port: Mutex<Option<DevicePort>>,
    playback_starts: AtomicU32,
}

struct SelftestBackend {
    hooks: Arc<Hooks>,
}

impl AudioBackend for SelftestBackend {
    fn playback_setup(
        &mut self,
        _sink: Option<&str>,
        _channels: usize,
        _sample_rate: u32,
        requested_period_frames: usize,
        port: DevicePort,
    ) -> Result<PlaybackSetup, BackendError> {
        *self.hooks.port.lock() = Some(port);
        Ok(PlaybackSetup {
            max_period_frames: requested_period_frames,
            start_frames: requested_period_frames,
        })
    }

    fn playback_start(&mut self) {
        self.hooks.playback_starts.fetch_add(1, Ordering::Relaxed);
    }

    fn playback_stop(&mut self) {}
    fn playback_set_volume(&mut self, _gains: &[f32]) {}
    fn playback_set_mute(&mut self, _mute: bool) {}

    fn playback_latency_frames(&self) -> u64 {
        0
    }

    fn record_start(
        &mut self,
        _source: Option<&str>,
        _channels: usize,
        _sample_rate: u32,
        _port: CapturePort,
    ) -> Result<(), BackendError> {
        Ok(())
    }

    fn record_stop(&mut self) {}
    fn record_set_volume(&mut self, _gains: &[f32]) {}
    fn record_set_mute(&mut self, _mute: bool) {}
}

fn sine_packet(frames: usize, frequency_hz: f32, phase_frame: &mut u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(frames * CHANNELS * 2);
    for _ in 0..frames {
        let phase = frequency_hz * *phase_frame as f32 / SAMPLE_RATE as f32;
        let sample = ((phase * TAU).sin() * 0.5 * 32767.0) as i16;
        for _ in 0..CHANNELS {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        *phase_frame += 1;
    }
    bytes
}

fn rms(signal: &[f32]) -> f32 {
    if signal.is_empty() {
        return 0.0;
    }
    let energy: f32 = signal.iter().map(|s| s * s).sum();
    (energy / signal.len() as f32).sqrt()
}

#[test]
fn selftest_sine_through_pipeline() {
    let hooks = Arc::new(Hooks::default());
    let backend = SelftestBackend {
        hooks: hooks.clone(),
    };
    let opts = EngineOpts {
        period_size: PERIOD,
        ..EngineOpts::default()
    };
    let mut engine = AudioEngine::new(opts, Box::new(backend), None);

    engine.playback_start(CHANNELS, SAMPLE_RATE, SampleFormat::S16, 0);
    assert_eq!(engine.status().state, StreamState::SetupProducer);

    let mut now = 0i64;
    let mut phase_frame = 0u64;

    // First guest packet opens the gate and activates the device.
    let packet = sine_packet(PERIOD, 440.0, &mut phase_frame);
    engine.playback_data_at(&packet, now);
    assert_eq!(engine.status().state, StreamState::SetupConsumer);
    assert_eq!(hooks.playback_starts.load(Ordering::Relaxed), 1);

    let port = hooks.port.lock().clone().expect("backend received a port");
    assert_eq!(port.channels(), CHANNELS);
    assert_eq!(port.sample_rate(), SAMPLE_RATE);

    let mut recorded = Vec::new();
    let mut buffer = vec![0.0f32; PERIOD * CHANNELS];
    for _ in 0..100 {
        now += PERIOD_NS;
        let packet = sine_packet(PERIOD, 440.0, &mut phase_frame);
        engine.playback_data_at(&packet, now);
        let pulled = port.pull_at(&mut buffer, now + PERIOD_NS / 2);
        assert_eq!(pulled, PERIOD);
        recorded.extend_from_slice(&buffer);
    }

    assert_eq!(engine.status().state, StreamState::Run);

    // The startup gate pre-arms silence, so judge the tail only.
    let tail = &recorded[recorded.len() / 2..];
    let tail_rms = rms(tail);
    let expected_rms = 0.5 / std::f32::consts::SQRT_2;
    assert!(
        (tail_rms - expected_rms).abs() < 0.05,
        "tail RMS {tail_rms}, expected about {expected_rms}"
    );

    let peak = tail.iter().fold(0.0f32, |m, s| m.max(s.abs()));
    assert!(peak > 0.4 && peak < 0.6, "peak {peak}");
}

#[test]
fn selftest_sample_preservation_at_unity_ratio() {
    let hooks = Arc::new(Hooks::default());
    let backend = SelftestBackend {
        hooks: hooks.clone(),
    };
    let mut engine = AudioEngine::new(EngineOpts::default(), Box::new(backend), None);
    engine.playback_start(CHANNELS, SAMPLE_RATE, SampleFormat::S16, 0);

    // With no pulls there are no device ticks, the controller free-runs and
    // the ratio stays at exactly 1.0.
    let mut now = 0i64;
    let mut phase_frame = 0u64;
    let mut pushed = 0i64;
    for _ in 0..50 {
        let packet = sine_packet(PERIOD, 440.0, &mut phase_frame);
        engine.playback_data_at(&packet, now);
        pushed += PERIOD as i64;
        now += PERIOD_NS;
    }

    let status = engine.status();
    assert_eq!(status.ratio, 1.0);
    let drift = status.ring_frames - pushed;
    assert!(drift.abs() < 64, "frame drift {drift} after {pushed} frames");
}

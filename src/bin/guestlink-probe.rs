//! Synthetic end-to-end probe: drives the playback engine with a generated
//! tone against an in-process device thread and reports latency behaviour.

use std::env;
use std::f32::consts::TAU;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use guestlink_audio::{
    init_tracing, AudioBackend, AudioEngine, BackendError, CapturePort, DevicePort, EngineOpts,
    PlaybackSetup, SampleFormat,
};

const SAMPLE_RATE: u32 = 48_000;
const CHANNELS: usize = 2;
const PACKET_FRAMES: usize = 480;
const PACKET_INTERVAL: Duration = Duration::from_millis(10);

struct ProbeShared {
    port: Mutex<Option<DevicePort>>,
    period_frames: Mutex<usize>,
    running: AtomicBool,
}

/// Backend that stands in for the audio server: a plain thread pulling one
/// period per sleep interval.
struct ProbeBackend {
    shared: Arc<ProbeShared>,
    consumer: Option<thread::JoinHandle<()>>,
}

impl ProbeBackend {
    fn new() -> Self {
        Self {
            shared: Arc::new(ProbeShared {
                port: Mutex::new(None),
                period_frames: Mutex::new(PACKET_FRAMES),
                running: AtomicBool::new(false),
            }),
            consumer: None,
        }
    }
}

impl AudioBackend for ProbeBackend {
    fn playback_setup(
        &mut self,
        _sink: Option<&str>,
        _channels: usize,
        _sample_rate: u32,
        requested_period_frames: usize,
        port: DevicePort,
    ) -> Result<PlaybackSetup, BackendError> {
        *self.shared.port.lock() = Some(port);
        *self.shared.period_frames.lock() = requested_period_frames;
        Ok(PlaybackSetup {
            max_period_frames: requested_period_frames,
            start_frames: requested_period_frames * 2,
        })
    }

    fn playback_start(&mut self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = self.shared.clone();
        self.consumer = Some(thread::spawn(move || {
            let mut buffer = Vec::new();
            while shared.running.load(Ordering::SeqCst) {
                let period = *shared.period_frames.lock();
                let port = shared.port.lock().clone();
                if let Some(port) = port {
                    buffer.resize(period * port.channels(), 0.0);
                    port.pull(&mut buffer);
                }
                thread::sleep(Duration::from_nanos(
                    (period as u64 * 1_000_000_000) / SAMPLE_RATE as u64,
                ));
            }
        }));
    }

    fn playback_stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(consumer) = self.consumer.take() {
            let _ = consumer.join();
        }
    }

    fn playback_set_volume(&mut self, _gains: &[f32]) {}
    fn playback_set_mute(&mut self, _mute: bool) {}

    fn playback_latency_frames(&self) -> u64 {
        *self.shared.period_frames.lock() as u64
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

fn sine_packet(phase_frame: &mut u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(PACKET_FRAMES * CHANNELS * 2);
    for _ in 0..PACKET_FRAMES {
        let phase = 440.0 * *phase_frame as f32 / SAMPLE_RATE as f32;
        let sample = ((phase * TAU).sin() * 0.25 * 32767.0) as i16;
        for _ in 0..CHANNELS {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        *phase_frame += 1;
    }
    bytes
}

fn print_status(engine: &AudioEngine, elapsed: Duration) {
    let status = engine.status();
    let latest = status.latency_ms.last().copied().unwrap_or(0.0);
    println!(
        "[{:5.1}s] state={:?} ring={} frames  offset={:.0}/{:.0} frames  ratio={:+.1} ppm  latency={:.2} ms",
        elapsed.as_secs_f32(),
        status.state,
        status.ring_frames,
        status.offset_frames,
        status.target_frames,
        (status.ratio - 1.0) * 1.0e6,
        latest,
    );
}

fn run(seconds: u64) {
    let mut engine = AudioEngine::new(
        EngineOpts {
            period_size: PACKET_FRAMES,
            ..EngineOpts::default()
        },
        Box::new(ProbeBackend::new()),
        None,
    );

    engine.playback_start(CHANNELS, SAMPLE_RATE, SampleFormat::S16, 0);

    let started = Instant::now();
    let mut phase_frame = 0u64;
    let mut next_packet = started;
    let mut next_report = started + Duration::from_secs(1);
    let deadline = started + Duration::from_secs(seconds);

    while Instant::now() < deadline {
        let packet = sine_packet(&mut phase_frame);
        engine.playback_data(&packet);

        if Instant::now() >= next_report {
            print_status(&engine, started.elapsed());
            next_report += Duration::from_secs(1);
        }

        next_packet += PACKET_INTERVAL;
        if let Some(wait) = next_packet.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }
    }

    engine.playback_stop();
    print_status(&engine, started.elapsed());
}

fn main() {
    init_tracing();

    let mut seconds = 5u64;
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--seconds" | "-s" => {
                let Some(value) = args.next().and_then(|v| v.parse().ok()) else {
                    eprintln!("guestlink-probe: --seconds expects a number");
                    process::exit(1);
                };
                seconds = value;
            }
            "--help" | "-h" => {
                println!(
                    "Usage: guestlink-probe [--seconds N]\n\nDrives the playback engine with a 440 Hz tone against a synthetic\ndevice thread and prints the latency loop's behaviour once per second."
                );
                return;
            }
            other => {
                eprintln!("guestlink-probe: unknown argument '{other}'");
                process::exit(1);
            }
        }
    }

    run(seconds);
}

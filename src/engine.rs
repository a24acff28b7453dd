//! The playback engine: stream lifecycle, producer push path, consumer pull
//! path.
//!
//! Two threads meet here. The protocol client's thread (the *producer*)
//! delivers guest packets through [`AudioEngine::playback_data`]; the audio
//! server's realtime thread (the *consumer*) drains frames through
//! [`DevicePort::pull`]. Each side owns its mutable state outright; they
//! share only the sample ring, the timing ring, and a handful of atomics.
//!
//! Every entry point taking a timestamp has an `_at` variant so tests can
//! drive the pipeline on a synthetic clock.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use tracing::{debug, error, warn};

use crate::clock::{
    ClockTracker, DeviceWindow, Observation, PeriodChangeRule, DESYNC_THRESHOLD_SEC,
};
use crate::device::{
    channel_gains, AudioBackend, CapturePort, CaptureSink, SampleFormat,
};
use crate::latency::{target_latency_frames, LatencyController, LatencyWindow};
use crate::resample::{s16le_to_f32, ResampleError, Resampler, SincResampler};
use crate::ring::{now_ns, timing_ring, ClockTick, SampleRing, TimingRx, TimingTx};
use crate::EngineOpts;

/// Seconds of consumed silence after which a kept-alive stream closes.
const KEEP_ALIVE_STOP_SEC: i64 = 30;

/// Extra frames allowed for sinc filter warmup when re-entering a kept-alive
/// stream.
const RESAMPLER_STARTUP_FRAMES: f64 = 20.0;

/// Guest packets between latency callback invocations.
const LATENCY_CB_INTERVAL: u32 = 8;

/// Capacity of the diagnostic latency history window.
const LATENCY_WINDOW_LEN: usize = 1200;

const MAX_VOLUME_CHANNELS: usize = 8;

/// Lifecycle of the playback stream.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No stream; nothing is allocated.
    Stop = 0,
    /// Stream allocated, waiting for the first guest packet.
    SetupProducer = 1,
    /// Device opened, waiting for the startup fill level.
    SetupConsumer = 2,
    /// Steady-state playback.
    Run = 3,
    /// Guest stopped sending; resources retained for a quick restart.
    KeepAlive = 4,
}

impl StreamState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::SetupProducer,
            2 => Self::SetupConsumer,
            3 => Self::Run,
            4 => Self::KeepAlive,
            _ => Self::Stop,
        }
    }

    /// Whether the stream is playing or retained for restart.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Run | Self::KeepAlive)
    }
}

/// State shared between the two threads for one open stream.
struct StreamShared {
    channels: usize,
    sample_rate: u32,
    state: AtomicU8,
    target_start_frames: AtomicI64,
    ring: SampleRing,
    // The consumer-owned block sits on its own cache line so producer-side
    // ring writes do not invalidate it.
    device: CachePadded<UnsafeCell<DeviceSide>>,
}

// The ring and the atomics are built for cross-thread use; `device` is
// touched only by the audio server's single consumer thread, through
// `DevicePort::pull`.
unsafe impl Send for StreamShared {}
unsafe impl Sync for StreamShared {}

impl StreamShared {
    fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Mutable state owned by the consumer thread. Nothing else reads or
/// writes it; [`DevicePort::pull_at`] is the only access path.
struct DeviceSide {
    clock: ClockTracker,
    ticks: TimingTx,
}

/// Mutable state owned by the producer thread.
struct ProducerSide {
    clock: ClockTracker,
    window: DeviceWindow,
    controller: LatencyController,
    resampler: Box<dyn Resampler>,
    ticks: TimingRx,
    frames_in: Vec<f32>,
    frames_out: Vec<f32>,
    data_calls: u32,
    latency_window: LatencyWindow,
    last_actual_offset: f64,
    last_target: f64,
    last_ratio: f64,
}

struct ActivePlayback {
    shared: Arc<StreamShared>,
    side: ProducerSide,
    device_max_period_frames: usize,
    device_start_frames: usize,
}

#[derive(Default)]
struct RecordState {
    requested: bool,
    started: bool,
    volume: [u16; MAX_VOLUME_CHANNELS],
    volume_channels: usize,
    mute: bool,
    last_channels: usize,
    last_sample_rate: u32,
}

/// Consumer-side handle handed to the audio backend at stream setup.
///
/// The backend's realtime callback calls [`pull`](Self::pull); everything it
/// does is wait-free and allocation-free. The handle keeps the stream's
/// buffers alive, so a pull racing a producer-side stop simply reads
/// silence.
///
/// The handle models the server's single realtime consumer: clones may be
/// moved between callbacks, but pulls must come from one thread at a time.
#[derive(Clone)]
pub struct DevicePort {
    shared: Arc<StreamShared>,
}

impl DevicePort {
    /// Channel count of the open stream.
    pub fn channels(&self) -> usize {
        self.shared.channels
    }

    /// Sample rate of the open stream.
    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate
    }

    /// Whether the stream is still worth pulling from.
    pub fn is_active(&self) -> bool {
        self.shared.state().is_active()
    }

    /// Fill `dst` with the next period of interleaved `f32` frames.
    ///
    /// Returns the frame count written: the full request while the stream
    /// runs (zero-padded on underrun), 0 otherwise.
    pub fn pull(&self, dst: &mut [f32]) -> usize {
        self.pull_at(dst, now_ns())
    }

    /// [`pull`](Self::pull) with an explicit monotonic timestamp.
    pub fn pull_at(&self, dst: &mut [f32], now_ns: i64) -> usize {
        let shared = &*self.shared;
        let frames = dst.len() / shared.channels;
        if frames == 0 {
            return 0;
        }
        if matches!(
            shared.state(),
            StreamState::Stop | StreamState::SetupProducer
        ) {
            dst.fill(0.0);
            return 0;
        }
        // Owned by this, the sole consumer thread; see `StreamShared`.
        let device = unsafe { &mut *shared.device.get() };

        if shared.state() == StreamState::SetupConsumer {
            /* The device may start pulling before the startup fill level is
             * reached. Rewind the read position over the shortfall so the
             * first reads come back as silence instead of underrunning. */
            let offset =
                shared.ring.count() - shared.target_start_frames.load(Ordering::Acquire);
            if offset < 0 {
                device.clock.advance_position(offset);
                shared.ring.discard(offset);
            }
            shared.set_state(StreamState::Run);
        }

        match device.clock.observe(now_ns, frames) {
            Observation::Started | Observation::PeriodChanged | Observation::Locked { .. } => {
                device.clock.advance_position(frames as i64);
            }
            Observation::Desync { error_sec } => {
                let slew = (error_sec * shared.sample_rate as f64).round() as i64;
                shared.ring.discard(slew);
                device.clock.resync(now_ns, frames);
                device.clock.advance_position(slew + frames as i64);
                debug!(slew, error_sec, "device clock slew");
            }
        }

        device.ticks.publish(ClockTick {
            period_frames: device.clock.period_frames(),
            next_time_ns: device.clock.next_time_ns(),
            next_position: device.clock.next_position(),
        });

        shared.ring.consume(dst);

        if shared.state() == StreamState::KeepAlive {
            let stop_frames = KEEP_ALIVE_STOP_SEC * shared.sample_rate as i64;
            if shared.ring.count() <= -stop_frames {
                shared.set_state(StreamState::Stop);
                debug!("keep-alive expired, stream marked stopped");
            }
        }

        frames
    }
}

/// Diagnostic snapshot of the engine.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    /// Current stream state.
    pub state: StreamState,
    /// Channel count of the open stream, or 0.
    pub channels: usize,
    /// Sample rate of the open stream, or 0.
    pub sample_rate: u32,
    /// Signed sample-ring fill in frames.
    pub ring_frames: i64,
    /// Last measured producer-ahead-of-device offset in frames.
    pub offset_frames: f64,
    /// Filtered offset error the controller is acting on, in frames.
    pub offset_error: f64,
    /// Current target latency in frames.
    pub target_frames: f64,
    /// Resampling ratio applied to the last guest packet.
    pub ratio: f64,
    /// Recent total-latency samples in milliseconds, oldest first.
    pub latency_ms: Vec<f32>,
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self {
            state: StreamState::Stop,
            channels: 0,
            sample_rate: 0,
            ring_frames: 0,
            offset_frames: 0.0,
            offset_error: 0.0,
            target_frames: 0.0,
            ratio: 1.0,
            latency_ms: Vec::new(),
        }
    }
}

/// The playback engine. All methods are called from the protocol client's
/// thread; the audio server reaches the engine only through the
/// [`DevicePort`] handed out at stream setup.
///
/// Drop order matters at shutdown: stop the audio server first so its
/// realtime thread no longer pulls, then drop the engine.
pub struct AudioEngine {
    opts: EngineOpts,
    backend: Box<dyn AudioBackend>,
    capture_sink: Option<Arc<dyn CaptureSink>>,
    playback: Option<ActivePlayback>,
    volume: [u16; MAX_VOLUME_CHANNELS],
    volume_channels: usize,
    mute: bool,
    last_channels: usize,
    last_sample_rate: u32,
    record: RecordState,
}

impl AudioEngine {
    /// Create an engine over the given backend. `capture_sink` receives
    /// captured audio when the guest requests recording; pass `None` on
    /// playback-only hosts.
    pub fn new(
        opts: EngineOpts,
        backend: Box<dyn AudioBackend>,
        capture_sink: Option<Arc<dyn CaptureSink>>,
    ) -> Self {
        Self {
            opts,
            backend,
            capture_sink,
            playback: None,
            volume: [0; MAX_VOLUME_CHANNELS],
            volume_channels: 0,
            mute: false,
            last_channels: 0,
            last_sample_rate: 0,
            record: RecordState::default(),
        }
    }

    /// Open a playback stream for the negotiated format.
    ///
    /// Restarting a kept-alive stream with an unchanged format is free: the
    /// retained resources are reused and the next packet slews straight to
    /// the target latency.
    pub fn playback_start(
        &mut self,
        channels: usize,
        sample_rate: u32,
        format: SampleFormat,
        _timestamp: u32,
    ) {
        if format != SampleFormat::S16 {
            error!(?format, "unsupported playback format");
            return;
        }
        if channels == 0 || sample_rate == 0 {
            error!(channels, sample_rate, "invalid playback format");
            return;
        }
        if self
            .playback
            .as_ref()
            .is_some_and(|p| p.shared.state() == StreamState::KeepAlive)
            && channels == self.last_channels
            && sample_rate == self.last_sample_rate
        {
            return;
        }
        if self.playback.is_some() {
            self.teardown_playback();
        }

        let resampler: Box<dyn Resampler> = match SincResampler::new(channels) {
            Ok(resampler) => Box::new(resampler),
            Err(error) => {
                error!(%error, "failed to create resampler");
                return;
            }
        };

        let (tick_tx, tick_rx) = timing_ring();
        let shared = Arc::new(StreamShared {
            channels,
            sample_rate,
            state: AtomicU8::new(StreamState::SetupProducer as u8),
            target_start_frames: AtomicI64::new(0),
            ring: SampleRing::new(sample_rate as usize, channels),
            device: CachePadded::new(UnsafeCell::new(DeviceSide {
                clock: ClockTracker::new(sample_rate, PeriodChangeRule::OldPeriod),
                ticks: tick_tx,
            })),
        });

        self.last_channels = channels;
        self.last_sample_rate = sample_rate;

        let requested_period = self.opts.period_size.max(1);
        let setup = match self.backend.playback_setup(
            self.opts.sink.as_deref(),
            channels,
            sample_rate,
            requested_period,
            DevicePort {
                shared: shared.clone(),
            },
        ) {
            Ok(setup) => setup,
            Err(error) => {
                error!(%error, "failed to open playback stream");
                return;
            }
        };
        debug_assert!(setup.max_period_frames > 0);

        self.playback = Some(ActivePlayback {
            shared,
            side: ProducerSide {
                clock: ClockTracker::new(sample_rate, PeriodChangeRule::NewPeriod),
                window: DeviceWindow::default(),
                controller: LatencyController::new(),
                resampler,
                ticks: tick_rx,
                frames_in: Vec::new(),
                frames_out: Vec::new(),
                data_calls: 0,
                latency_window: LatencyWindow::new(LATENCY_WINDOW_LEN),
                last_actual_offset: 0.0,
                last_target: 0.0,
                last_ratio: 1.0,
            },
            device_max_period_frames: setup.max_period_frames.max(1),
            device_start_frames: setup.start_frames,
        });

        if self.volume_channels > 0 {
            let gains = channel_gains(&self.volume[..self.volume_channels]);
            self.backend.playback_set_volume(&gains);
        }
        self.backend.playback_set_mute(self.mute);
    }

    /// Stop playback. A running stream is kept alive for a while so a
    /// restart with the same format avoids device reconfiguration.
    pub fn playback_stop(&mut self) {
        let state = match self.playback.as_ref() {
            Some(active) => active.shared.state(),
            None => return,
        };
        match state {
            StreamState::Run => {
                if let Some(active) = self.playback.as_mut() {
                    active.shared.set_state(StreamState::KeepAlive);
                    active.side.resampler.reset();
                }
            }
            StreamState::SetupProducer | StreamState::SetupConsumer => {
                self.teardown_playback();
            }
            StreamState::KeepAlive | StreamState::Stop => {}
        }
    }

    /// Set per-channel playback volume. Cached across restarts and applied
    /// whenever a stream is active.
    pub fn playback_volume(&mut self, channels: usize, levels: &[u16]) {
        let count = channels.min(levels.len()).min(MAX_VOLUME_CHANNELS);
        self.volume[..count].copy_from_slice(&levels[..count]);
        self.volume_channels = count;

        if !self.playback_active() {
            return;
        }
        let gains = channel_gains(&self.volume[..count]);
        self.backend.playback_set_volume(&gains);
    }

    /// Set playback mute. Cached across restarts.
    pub fn playback_mute(&mut self, mute: bool) {
        self.mute = mute;
        if !self.playback_active() {
            return;
        }
        self.backend.playback_set_mute(mute);
    }

    /// Push one guest packet of S16LE interleaved bytes.
    pub fn playback_data(&mut self, data: &[u8]) {
        self.playback_data_at(data, now_ns());
    }

    /// [`playback_data`](Self::playback_data) with an explicit monotonic
    /// timestamp.
    pub fn playback_data_at(&mut self, data: &[u8], now_ns: i64) {
        // Reclaim a stream the consumer side shut down.
        if self
            .playback
            .as_ref()
            .is_some_and(|p| p.shared.state() == StreamState::Stop)
        {
            self.teardown_playback();
        }
        let Some(active) = self.playback.as_mut() else {
            return;
        };
        if data.is_empty() {
            return;
        }
        if let Err(error) = push_packet(active, self.backend.as_mut(), &self.opts, data, now_ns) {
            error!(%error, "aborting playback stream");
            self.teardown_playback();
        }
    }

    /// Device latency in milliseconds, passed through from the backend.
    pub fn latency_ms(&self) -> u64 {
        let Some(active) = self.playback.as_ref() else {
            return 0;
        };
        self.backend.playback_latency_frames() * 1000 / active.shared.sample_rate as u64
    }

    /// Diagnostic snapshot.
    pub fn status(&self) -> EngineStatus {
        match self.playback.as_ref() {
            None => EngineStatus::default(),
            Some(active) => EngineStatus {
                state: active.shared.state(),
                channels: active.shared.channels,
                sample_rate: active.shared.sample_rate,
                ring_frames: active.shared.ring.count(),
                offset_frames: active.side.last_actual_offset,
                offset_error: active.side.controller.offset_error(),
                target_frames: active.side.last_target,
                ratio: active.side.last_ratio,
                latency_ms: active.side.latency_window.snapshot(),
            },
        }
    }

    /// Start capturing host audio for the guest.
    pub fn record_start(&mut self, channels: usize, sample_rate: u32, _format: SampleFormat) {
        if self.record.started {
            if channels != self.record.last_channels
                || sample_rate != self.record.last_sample_rate
            {
                self.backend.record_stop();
                self.record.started = false;
            } else {
                return;
            }
        }
        self.record.requested = true;
        self.record.last_channels = channels;
        self.record.last_sample_rate = sample_rate;

        let Some(sink) = self.capture_sink.clone() else {
            warn!("no capture sink configured, ignoring record start");
            return;
        };
        match self.backend.record_start(
            self.opts.source.as_deref(),
            channels,
            sample_rate,
            CapturePort::new(sink),
        ) {
            Ok(()) => {
                self.record.started = true;
                if self.record.volume_channels > 0 {
                    let gains = channel_gains(&self.record.volume[..self.record.volume_channels]);
                    self.backend.record_set_volume(&gains);
                }
                self.backend.record_set_mute(self.record.mute);
            }
            Err(error) => error!(%error, "failed to open capture stream"),
        }
    }

    /// Stop capturing.
    pub fn record_stop(&mut self) {
        self.record.requested = false;
        if !self.record.started {
            return;
        }
        self.backend.record_stop();
        self.record.started = false;
    }

    /// Set per-channel capture volume. Cached across restarts.
    pub fn record_volume(&mut self, channels: usize, levels: &[u16]) {
        let count = channels.min(levels.len()).min(MAX_VOLUME_CHANNELS);
        self.record.volume[..count].copy_from_slice(&levels[..count]);
        self.record.volume_channels = count;

        if !self.record.started {
            return;
        }
        let gains = channel_gains(&self.record.volume[..count]);
        self.backend.record_set_volume(&gains);
    }

    /// Set capture mute. Cached across restarts.
    pub fn record_mute(&mut self, mute: bool) {
        self.record.mute = mute;
        if !self.record.started {
            return;
        }
        self.backend.record_set_mute(mute);
    }

    fn playback_active(&self) -> bool {
        self.playback
            .as_ref()
            .is_some_and(|p| p.shared.state().is_active())
    }

    fn teardown_playback(&mut self) {
        if let Some(active) = self.playback.take() {
            active.shared.set_state(StreamState::Stop);
            self.backend.playback_stop();
        }
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.teardown_playback();
        self.record_stop();
    }
}

fn push_packet(
    active: &mut ActivePlayback,
    backend: &mut dyn AudioBackend,
    opts: &EngineOpts,
    data: &[u8],
    now_ns: i64,
) -> Result<(), ResampleError> {
    let ActivePlayback {
        shared,
        side,
        device_max_period_frames,
        device_start_frames,
    } = active;
    let shared = &**shared;
    let channels = shared.channels;
    let sample_rate = shared.sample_rate as f64;
    let stride = channels * 2;
    let frames = data.len() / stride;
    if frames == 0 {
        return Ok(());
    }
    let state = shared.state();

    if frames != side.clock.period_frames() {
        side.frames_in.resize(frames * channels, 0.0);
        side.frames_out
            .resize((frames as f64 * 1.1).round() as usize * channels, 0.0);
    }
    s16le_to_f32(
        &data[..frames * stride],
        &mut side.frames_in[..frames * channels],
    );

    while let Some(tick) = side.ticks.pop() {
        side.window.absorb(tick);
    }

    let target = target_latency_frames(
        *device_max_period_frames,
        side.window.period_frames(),
        opts.buffer_latency_ms,
        shared.sample_rate,
    );

    // Measure the guest clock.
    let keep_alive = state == StreamState::KeepAlive;
    let cur_time: i64;
    let cur_position: i64;
    let mut device_position = None;

    if !side.clock.is_started() {
        cur_time = now_ns;
        cur_position = side.clock.next_position();
        side.clock.observe(now_ns, frames);
    } else if frames != side.clock.period_frames() {
        cur_time = side.clock.next_time_ns();
        cur_position = side.clock.next_position();
        side.clock.observe(now_ns, frames);
    } else {
        let error_sec = side.clock.pending_error_sec(now_ns);
        if error_sec.abs() >= DESYNC_THRESHOLD_SEC || keep_alive {
            /* The clock drifted too far, or a retained stream is being
             * re-entered. When the device position is known, slew straight
             * to the target latency; otherwise slew by the raw error. */
            let slew = if side.window.ready() {
                let position = side.window.position_at(now_ns);
                device_position = Some(position);
                let mut target_position = position + target;
                if keep_alive {
                    target_position += RESAMPLER_STARTUP_FRAMES;
                }
                (target_position - side.clock.next_position() as f64).round() as i64
            } else {
                (error_sec * sample_rate).round() as i64
            };

            shared.ring.append_silence(slew);
            cur_time = now_ns;
            cur_position = side.clock.next_position() + slew;
            side.clock.resync(now_ns, frames);
            side.clock.set_position(cur_position);
            side.controller.reset();
            shared.set_state(StreamState::Run);
            debug!(slew, error_sec, "producer clock slew");
        } else {
            cur_time = side.clock.next_time_ns();
            cur_position = side.clock.next_position();
            side.clock.observe(now_ns, frames);
        }
    }

    /* Offset between where the guest is writing and where the device is
     * playing, measured against the target latency. The raw value moves
     * violently at startup, so it runs through the PLL's filter before the
     * controller sees it. */
    let actual_offset_error = if side.window.ready() {
        let position = device_position.unwrap_or_else(|| side.window.position_at(cur_time));
        let actual_offset = cur_position as f64 - position;
        side.last_actual_offset = actual_offset;
        Some(-(actual_offset - target))
    } else {
        side.last_actual_offset = 0.0;
        None
    };

    let ratio = side.controller.update(
        actual_offset_error,
        side.clock.b(),
        side.clock.c(),
        side.clock.period_sec(),
    );
    side.last_ratio = ratio;
    side.last_target = target;

    let mut consumed = 0usize;
    while consumed < frames {
        let input = &side.frames_in[consumed * channels..frames * channels];
        let (used, generated) = side.resampler.process(input, &mut side.frames_out, ratio)?;
        if used == 0 && generated == 0 {
            break;
        }
        shared.ring.append(&side.frames_out[..generated * channels]);
        side.clock.advance_position(generated as i64);
        consumed += used;
    }

    if shared.state() == StreamState::SetupProducer {
        /* Packet pacing from the guest is poor at startup, so require two
         * full producer periods on top of the device's startup demand
         * before opening the gate. The device itself is activated
         * immediately; if it starts early the consumer pre-arms silence. */
        let start_frames = side.clock.period_frames() * 2 + *device_start_frames;
        shared
            .target_start_frames
            .store(start_frames as i64, Ordering::Release);
        shared.set_state(StreamState::SetupConsumer);
        backend.playback_start();
    }

    side.data_calls = side.data_calls.wrapping_add(1);
    let device_latency = backend.playback_latency_frames() as f64;
    let offset_ms = side.last_actual_offset * 1000.0 / sample_rate;
    let device_ms = device_latency * 1000.0 / sample_rate;
    let total_ms = offset_ms + device_ms;
    side.latency_window.push(total_ms as f32);
    if side.data_calls % LATENCY_CB_INTERVAL == 0 {
        if let Some(cb) = opts.latency_cb.as_ref() {
            cb(total_ms as f32, offset_ms as f32, device_ms as f32);
        }
    }

    Ok(())
}

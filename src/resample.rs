//! Sample-rate conversion for the producer path.
//!
//! The engine adjusts playback speed by resampling every guest packet with a
//! ratio chosen by the latency controller, so the converter must accept a
//! new ratio on every call. [`Resampler`] is the seam; [`SincResampler`]
//! implements it on top of `rubato`'s sinc converter.

use rubato::{
    Resampler as RubatoResampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType,
    WindowFunction,
};
use thiserror::Error;

/// Largest deviation from unity ratio the converter accepts. Steady-state
/// corrections are within a tenth of a percent; startup transients can reach
/// a few percent.
pub const MAX_RATIO_DEVIATION: f64 = 0.10;

/// Errors from resampler construction or processing.
#[derive(Debug, Error)]
pub enum ResampleError {
    /// The stream's channel count cannot be resampled.
    #[error("unsupported channel count {0}")]
    UnsupportedChannels(usize),
    /// The underlying converter could not be built.
    #[error("resampler construction failed: {0}")]
    Construct(String),
    /// The underlying converter rejected a processing call.
    #[error("resampling failed: {0}")]
    Process(String),
    /// The output buffer cannot hold the generated frames.
    #[error("resampler output overflow: {generated} frames into {capacity}")]
    OutputOverflow {
        /// Frames the converter produced.
        generated: usize,
        /// Frames the output buffer can hold.
        capacity: usize,
    },
}

/// A sample-rate converter taking a fresh ratio on every call.
///
/// `process` consumes from `input` and writes to `output` (both interleaved),
/// returning `(frames_used, frames_generated)`; neither exceeds what the
/// buffers hold. `reset` clears internal state without dropping the
/// instance, so a retained stream restarts clean.
pub trait Resampler: Send {
    /// Convert as much of `input` as the converter wants at `ratio`
    /// (output rate over input rate).
    fn process(
        &mut self,
        input: &[f32],
        output: &mut [f32],
        ratio: f64,
    ) -> Result<(usize, usize), ResampleError>;

    /// Clear filter history and ratio state.
    fn reset(&mut self);
}

/// Sinc-interpolating [`Resampler`] backed by [`rubato::SincFixedIn`].
///
/// The inner converter works on fixed-size planar chunks, so it is built
/// lazily once the producer period is known and rebuilt when the period
/// changes. Only the producer thread touches this type.
pub struct SincResampler {
    channels: usize,
    chunk_frames: usize,
    inner: Option<SincFixedIn<f32>>,
    planar_in: Vec<Vec<f32>>,
    planar_out: Vec<Vec<f32>>,
    ratio: f64,
}

impl SincResampler {
    /// Create a converter for `channels`-channel interleaved audio.
    pub fn new(channels: usize) -> Result<Self, ResampleError> {
        if channels == 0 || channels > 8 {
            return Err(ResampleError::UnsupportedChannels(channels));
        }
        Ok(Self {
            channels,
            chunk_frames: 0,
            inner: None,
            planar_in: Vec::new(),
            planar_out: Vec::new(),
            ratio: 1.0,
        })
    }

    fn ensure_chunk(&mut self, frames: usize) -> Result<(), ResampleError> {
        if self.chunk_frames == frames && self.inner.is_some() {
            return Ok(());
        }
        let parameters = SincInterpolationParameters {
            sinc_len: 64,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };
        let inner = SincFixedIn::<f32>::new(
            1.0,
            1.0 + MAX_RATIO_DEVIATION,
            parameters,
            frames,
            self.channels,
        )
        .map_err(|e| ResampleError::Construct(e.to_string()))?;
        let out_max = inner.output_frames_max();
        self.planar_in = vec![vec![0.0; frames]; self.channels];
        self.planar_out = vec![vec![0.0; out_max]; self.channels];
        self.chunk_frames = frames;
        self.ratio = 1.0;
        self.inner = Some(inner);
        Ok(())
    }
}

impl Resampler for SincResampler {
    fn process(
        &mut self,
        input: &[f32],
        output: &mut [f32],
        ratio: f64,
    ) -> Result<(usize, usize), ResampleError> {
        let frames = input.len() / self.channels;
        if frames == 0 {
            return Ok((0, 0));
        }
        // SincFixedIn only honours ratios within the relative bound it was
        // built with.
        let ratio = ratio.clamp(1.0 / (1.0 + MAX_RATIO_DEVIATION), 1.0 + MAX_RATIO_DEVIATION);
        self.ensure_chunk(frames)?;
        let Self {
            channels,
            inner,
            planar_in,
            planar_out,
            ratio: current,
            ..
        } = self;
        let channels = *channels;
        let inner = inner
            .as_mut()
            .ok_or_else(|| ResampleError::Construct("converter missing".into()))?;
        if ratio != *current {
            inner
                .set_resample_ratio(ratio, false)
                .map_err(|e| ResampleError::Process(e.to_string()))?;
            *current = ratio;
        }

        for (channel, plane) in planar_in.iter_mut().enumerate() {
            for (frame, sample) in plane.iter_mut().enumerate() {
                *sample = input[frame * channels + channel];
            }
        }

        let (used, generated) = inner
            .process_into_buffer(&*planar_in, &mut *planar_out, None)
            .map_err(|e| ResampleError::Process(e.to_string()))?;

        let capacity = output.len() / channels;
        if generated > capacity {
            return Err(ResampleError::OutputOverflow {
                generated,
                capacity,
            });
        }
        for (channel, plane) in planar_out.iter().enumerate() {
            for (frame, &sample) in plane[..generated].iter().enumerate() {
                output[frame * channels + channel] = sample;
            }
        }
        Ok((used, generated))
    }

    fn reset(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            inner.reset();
            let _ = inner.set_resample_ratio(1.0, false);
        }
        self.ratio = 1.0;
    }
}

/// Decode S16LE interleaved bytes into `f32` samples in `[-1.0, 1.0)`.
///
/// `out` must hold exactly `bytes.len() / 2` samples.
pub fn s16le_to_f32(bytes: &[u8], out: &mut [f32]) {
    for (pair, sample) in bytes.chunks_exact(2).zip(out.iter_mut()) {
        *sample = i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s16_conversion_scales() {
        let bytes = [
            0x00, 0x00, // 0
            0xff, 0x7f, // 32767
            0x00, 0x80, // -32768
        ];
        let mut out = [9.0f32; 3];
        s16le_to_f32(&bytes, &mut out);
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 32767.0 / 32768.0).abs() < 1e-7);
        assert_eq!(out[2], -1.0);
    }

    #[test]
    fn rejects_bad_channel_counts() {
        assert!(matches!(
            SincResampler::new(0),
            Err(ResampleError::UnsupportedChannels(0))
        ));
        assert!(matches!(
            SincResampler::new(9),
            Err(ResampleError::UnsupportedChannels(9))
        ));
    }

    #[test]
    fn unity_ratio_preserves_frame_count() {
        let mut resampler = SincResampler::new(2).expect("stereo");
        let chunk = 480usize;
        let input: Vec<f32> = (0..chunk * 2).map(|i| (i as f32 * 0.01).sin()).collect();
        let mut output = vec![0.0f32; chunk * 4];

        let mut fed = 0usize;
        let mut produced = 0usize;
        for _ in 0..100 {
            let (used, generated) = resampler.process(&input, &mut output, 1.0).expect("process");
            assert_eq!(used, chunk);
            fed += used;
            produced += generated;
        }
        let drift = fed as i64 - produced as i64;
        assert!(drift.abs() < 64, "frame drift {drift}");
    }

    #[test]
    fn faster_ratio_generates_more_frames() {
        let mut resampler = SincResampler::new(1).expect("mono");
        let chunk = 480usize;
        let input = vec![0.5f32; chunk];
        let mut output = vec![0.0f32; chunk * 2];

        let mut slow = 0usize;
        let mut fast = 0usize;
        for _ in 0..50 {
            slow += resampler.process(&input, &mut output, 1.0).expect("unity").1;
        }
        resampler.reset();
        for _ in 0..50 {
            fast += resampler.process(&input, &mut output, 1.02).expect("fast").1;
        }
        assert!(fast > slow, "expected {fast} > {slow}");
    }

    #[test]
    fn reset_restores_unity_ratio() {
        let mut resampler = SincResampler::new(1).expect("mono");
        let input = vec![0.0f32; 256];
        let mut output = vec![0.0f32; 512];
        resampler.process(&input, &mut output, 1.05).expect("shifted");
        resampler.reset();

        let mut produced = 0usize;
        for _ in 0..50 {
            produced += resampler.process(&input, &mut output, 1.0).expect("unity").1;
        }
        let drift = produced as i64 - 50 * 256;
        assert!(drift.abs() < 64, "frame drift {drift}");
    }
}

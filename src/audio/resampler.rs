//! # Sample-Rate Conversion
//!
//! Converts PCM16 buffers between the 8kHz telephony leg and the 24kHz agent leg.
//!
//! ## Pipeline (both directions):
//! 1. **Normalize**: `i16` samples become `f32` in [-1.0, 1.0] (divide by 32768)
//! 2. **Resample**: band-limited windowed-sinc interpolation via `rubato`, which
//!    suppresses spectral images when upsampling and aliasing when downsampling
//! 3. **Quantize**: clamp to [-1.0, 1.0], scale by 32767, round to `i16`
//!
//! The 32768/32767 asymmetry is deliberate and must be preserved. Quantization
//! rounds to nearest rather than truncating towards zero the way a plain
//! float-to-int cast does. With rounding, a plain `i16 -> f32 -> i16` round
//! trip is exact for |x| <= 16384 only; above that it may land one step
//! towards zero, and -32768 comes back as -32767. The exact round trip does
//! not hold for the whole `i16` range.
//!
//! ## Statelessness:
//! Every call builds its own resampler, feeds the whole buffer as one chunk,
//! flushes the filter tail with silence and lines the output up with the
//! input. Nothing leaks between calls, so buffers from different calls (or
//! different frames of the same call) never influence each other.

use crate::audio::buffer::SampleRate;
use anyhow::Result;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

/// Tuning for the windowed-sinc filter.
#[derive(Debug, Clone)]
pub struct ResamplerConfig {
    /// Length of the sinc kernel in input samples (longer = sharper cutoff, more latency)
    pub sinc_len: usize,

    /// Cutoff relative to the lower Nyquist frequency of the two rates
    pub f_cutoff: f32,

    /// Number of interpolated kernel phases between input samples
    pub oversampling_factor: usize,

    /// Fade length applied to the telephony-bound path, in output samples
    pub fade_len: usize,
}

impl Default for ResamplerConfig {
    fn default() -> Self {
        Self {
            sinc_len: 128,
            f_cutoff: 0.95,
            oversampling_factor: 128,
            // ~2ms at 8kHz
            fade_len: SampleRate::Telephony.samples_for_ms(2),
        }
    }
}

/// Converts PCM16 buffers between the telephony and agent sample rates.
///
/// Constructed once at startup and shared by every call; all methods take
/// `&self` and never mutate their input.
#[derive(Debug, Clone)]
pub struct SampleRateConverter {
    config: ResamplerConfig,
}

impl SampleRateConverter {
    /// Create a converter with the given filter configuration.
    pub fn new(config: ResamplerConfig) -> Self {
        Self { config }
    }

    /// 8kHz -> 24kHz. Output length is exactly three times the input length.
    pub fn upsample(&self, samples_8k: &[i16]) -> Result<Vec<i16>> {
        self.convert(samples_8k, SampleRate::Telephony, SampleRate::Agent)
    }

    /// 24kHz -> 8kHz. Output length is `ceil(len / 3)`.
    pub fn downsample(&self, samples_24k: &[i16]) -> Result<Vec<i16>> {
        self.convert(samples_24k, SampleRate::Agent, SampleRate::Telephony)
    }

    /// The full agent -> telephony path: downsample, then fade the edges.
    pub fn downsample_for_telephony(&self, samples_24k: &[i16]) -> Result<Vec<i16>> {
        let samples_8k = self.downsample(samples_24k)?;
        Ok(apply_edge_fade(&samples_8k, self.config.fade_len))
    }

    fn convert(&self, input: &[i16], from: SampleRate, to: SampleRate) -> Result<Vec<i16>> {
        if input.is_empty() {
            return Ok(Vec::new());
        }

        let ratio = to.hz() as f64 / from.hz() as f64;
        let normalized = int16_to_float32(input);
        let resampled = self.resample(&normalized, ratio)?;
        Ok(float32_to_int16(&resampled))
    }

    /// Run one self-contained buffer through a fresh sinc resampler.
    ///
    /// ## Alignment:
    /// `SincFixedIn` starts its read position half a kernel before the first
    /// input sample, so its output is already centred on the input apart from a
    /// residual of `1 - 1/ratio - 1/oversampling_factor` input samples (late when
    /// positive). A negative residual is cancelled by leading silence, a positive
    /// one by skipping output frames. `output_delay()` does not apply here.
    fn resample(&self, input: &[f32], ratio: f64) -> Result<Vec<f32>> {
        let expected = (input.len() as f64 * ratio).ceil() as usize;
        let (lead_in, skip) = self.alignment(ratio);

        let params = SincInterpolationParameters {
            sinc_len: self.config.sinc_len,
            f_cutoff: self.config.f_cutoff,
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: self.config.oversampling_factor,
            window: WindowFunction::BlackmanHarris2,
        };
        let chunk_len = lead_in + input.len();
        let mut resampler = SincFixedIn::<f32>::new(ratio, 1.1, params, chunk_len, 1)?;

        let mut chunk = vec![0.0f32; lead_in];
        chunk.extend_from_slice(input);

        let needed = skip + expected;
        let mut output = Vec::with_capacity(needed);

        let first = resampler.process(&[chunk], None)?;
        output.extend_from_slice(&first[0]);

        // The kernel needs about one sinc length of input beyond the last output frame
        let input_needed = needed as f64 / ratio + (self.config.sinc_len + 4) as f64;
        let max_flushes = (input_needed / chunk_len as f64).ceil() as usize + 2;
        let mut flushes = 0;
        while output.len() < needed && flushes < max_flushes {
            let tail = resampler.process_partial(None::<&[Vec<f32>]>, None)?;
            output.extend_from_slice(&tail[0]);
            flushes += 1;
        }

        let mut aligned: Vec<f32> = output.into_iter().skip(skip).take(expected).collect();
        aligned.resize(expected, 0.0);
        Ok(aligned)
    }

    /// Leading silent input samples and skipped output frames that line the
    /// output up with the input for `ratio`.
    fn alignment(&self, ratio: f64) -> (usize, usize) {
        let oversampling = self.config.oversampling_factor.max(1) as f64;
        let late_by = 1.0 - 1.0 / ratio - 1.0 / oversampling;

        let lead_in = if late_by < 0.0 { (-late_by).round() } else { 0.0 };
        let skip = ((late_by + lead_in) * ratio).round().max(0.0);
        (lead_in as usize, skip as usize)
    }
}

/// Convert PCM16 samples to normalized floats (divide by 32768).
pub fn int16_to_float32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&sample| sample as f32 / 32768.0).collect()
}

/// Convert normalized floats to PCM16 (clamp to [-1, 1], multiply by 32767).
///
/// Out-of-range input is hard-clipped, never wrapped.
pub fn float32_to_int16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&sample| (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16)
        .collect()
}

/// Ramp the first and last `fade_len` samples from/to silence.
///
/// ## Behavior:
/// - Gains follow a linear ramp `0 ..= 1` over the head and `1 ..= 0` over the tail,
///   so the first and last samples are exactly zero
/// - Buffers shorter than `2 * fade_len` are returned unchanged (the two ramps
///   would overlap)
/// - The input is never modified; a new buffer is returned
pub fn apply_edge_fade(samples: &[i16], fade_len: usize) -> Vec<i16> {
    let mut faded = samples.to_vec();
    if fade_len == 0 || samples.len() < fade_len * 2 {
        return faded;
    }

    let len = faded.len();
    for i in 0..fade_len {
        let gain = ramp_gain(i, fade_len);
        faded[i] = (faded[i] as f32 * gain) as i16;
        faded[len - 1 - i] = (faded[len - 1 - i] as f32 * gain) as i16;
    }
    faded
}

/// Gain of step `i` in a linear 0 -> 1 ramp of `steps` points, endpoints included.
fn ramp_gain(i: usize, steps: usize) -> f32 {
    if steps <= 1 {
        return 0.0;
    }
    i as f32 / (steps - 1) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(len: usize, freq_hz: f32, rate_hz: f32, amplitude: f32) -> Vec<i16> {
        (0..len)
            .map(|n| {
                let t = n as f32 / rate_hz;
                (amplitude * (2.0 * std::f32::consts::PI * freq_hz * t).sin()) as i16
            })
            .collect()
    }

    fn converter() -> SampleRateConverter {
        SampleRateConverter::new(ResamplerConfig::default())
    }

    #[test]
    fn test_empty_buffers() {
        let converter = converter();
        assert!(converter.upsample(&[]).unwrap().is_empty());
        assert!(converter.downsample(&[]).unwrap().is_empty());
        assert!(converter.downsample_for_telephony(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_output_lengths() {
        let converter = converter();
        assert_eq!(converter.upsample(&vec![0i16; 240]).unwrap().len(), 720);
        assert_eq!(converter.downsample(&vec![0i16; 720]).unwrap().len(), 240);
        assert_eq!(converter.downsample(&vec![0i16; 721]).unwrap().len(), 241);
        assert_eq!(converter.upsample(&[1000]).unwrap().len(), 3);
    }

    #[test]
    fn test_round_trip_error_is_bounded() {
        let converter = converter();
        let original = sine(1600, 440.0, 8000.0, 12000.0);

        let restored = converter
            .downsample(&converter.upsample(&original).unwrap())
            .unwrap();
        assert!((restored.len() as i64 - original.len() as i64).abs() <= 1);

        let (mut error, mut energy) = (0f64, 0f64);
        for (a, b) in original.iter().zip(restored.iter()) {
            let diff = *a as f64 - *b as f64;
            error += diff * diff;
            energy += (*a as f64) * (*a as f64);
        }
        let nrmse = (error / energy).sqrt();
        assert!(nrmse < 0.1, "normalized RMS error too large: {}", nrmse);
    }

    /// Sum of tones below 3.5kHz; no period fits inside the test windows.
    fn multitone(len: usize, rate_hz: f32) -> Vec<i16> {
        (0..len)
            .map(|n| {
                let t = n as f32 / rate_hz;
                [313.0f32, 1171.0, 2203.0, 3089.0]
                    .iter()
                    .map(|f| 4000.0 * (2.0 * std::f32::consts::PI * f * t).sin())
                    .sum::<f32>() as i16
            })
            .collect()
    }

    /// Offset (in 24kHz samples) at which `high` best matches `low`.
    fn best_lag(low: &[i16], high: &[i16], max_lag: isize) -> isize {
        let margin = 120;
        (-max_lag..=max_lag)
            .max_by_key(|&lag| {
                (margin..low.len() - margin)
                    .map(|k| low[k] as i64 * high[(3 * k as isize + lag) as usize] as i64)
                    .sum::<i64>()
            })
            .unwrap()
    }

    #[test]
    fn test_upsample_is_time_aligned() {
        let converter = converter();
        let narrow = multitone(1600, 8000.0);
        let wide = converter.upsample(&narrow).unwrap();
        assert_eq!(best_lag(&narrow, &wide, 300), 0);
    }

    #[test]
    fn test_downsample_is_time_aligned() {
        let converter = converter();
        let wide = multitone(4800, 24000.0);
        let narrow = converter.downsample(&wide).unwrap();
        assert_eq!(best_lag(&narrow, &wide, 300), 0);
    }

    #[test]
    fn test_telephony_frame_keeps_its_tail() {
        let converter = converter();
        // One 20ms carrier frame
        let frame = sine(160, 440.0, 8000.0, 10000.0);
        let up = converter.upsample(&frame).unwrap();
        assert_eq!(up.len(), 480);

        let head_peak = up[..120].iter().map(|s| s.unsigned_abs()).max().unwrap();
        let tail_peak = up[360..].iter().map(|s| s.unsigned_abs()).max().unwrap();
        assert!(head_peak > 8000, "head peak was {}", head_peak);
        assert!(tail_peak > 8000, "tail peak was {}", tail_peak);
    }

    #[test]
    fn test_agent_chunk_keeps_its_tail() {
        let converter = converter();
        let chunk = sine(480, 440.0, 24000.0, 10000.0);
        let down = converter.downsample(&chunk).unwrap();
        assert_eq!(down.len(), 160);

        let tail_peak = down[120..].iter().map(|s| s.unsigned_abs()).max().unwrap();
        assert!(tail_peak > 8000, "tail peak was {}", tail_peak);
    }

    #[test]
    fn test_upsampled_tone_keeps_its_level() {
        let converter = converter();
        let tone = sine(800, 1000.0, 8000.0, 10000.0);
        let up = converter.upsample(&tone).unwrap();

        // Ignore the filter's edge transients
        let middle = &up[300..up.len() - 300];
        let peak = middle.iter().map(|s| s.unsigned_abs()).max().unwrap();
        assert!((9000..=11000).contains(&peak), "peak was {}", peak);
    }

    #[test]
    fn test_downsampling_rejects_content_above_telephony_nyquist() {
        let converter = converter();
        // 6kHz cannot be represented at 8kHz and must be filtered, not folded to 2kHz
        let tone = sine(2400, 6000.0, 24000.0, 16000.0);
        let down = converter.downsample(&tone).unwrap();

        let middle = &down[100..down.len() - 100];
        let peak = middle.iter().map(|s| s.unsigned_abs()).max().unwrap();
        assert!(peak < 1600, "aliased energy leaked through: peak {}", peak);
    }

    #[test]
    fn test_conversion_does_not_touch_input() {
        let converter = converter();
        let input = sine(160, 300.0, 8000.0, 5000.0);
        let snapshot = input.clone();
        let _ = converter.upsample(&input).unwrap();
        let _ = apply_edge_fade(&input, 16);
        assert_eq!(input, snapshot);
    }

    #[test]
    fn test_float_conversion_scaling() {
        assert_eq!(int16_to_float32(&[-32768, 0, 16384]), vec![-1.0, 0.0, 0.5]);
        // Hard clipping, no wraparound
        assert_eq!(float32_to_int16(&[1.5, -3.0, 1.0, -1.0]), vec![32767, -32767, 32767, -32767]);
    }

    #[test]
    fn test_int_float_round_trip() {
        for x in -16384i16..=16384 {
            let back = float32_to_int16(&int16_to_float32(&[x]))[0];
            assert_eq!(back, x);
        }
        for x in [i16::MIN + 1, -20000, 20000, 30000, i16::MAX] {
            let back = float32_to_int16(&int16_to_float32(&[x]))[0];
            assert!((back as i32 - x as i32).abs() <= 1, "{} came back as {}", x, back);
        }
        // The extreme negative value cannot be represented after scaling by 32767
        assert_eq!(float32_to_int16(&int16_to_float32(&[i16::MIN]))[0], -32767);
    }

    #[test]
    fn test_edge_fade_short_buffer_is_untouched() {
        let samples = vec![1000i16; 31];
        assert_eq!(apply_edge_fade(&samples, 16), samples);
    }

    #[test]
    fn test_edge_fade_ramps() {
        let samples = vec![10000i16; 64];
        let faded = apply_edge_fade(&samples, 16);

        assert_eq!(faded[0], 0);
        assert_eq!(faded[63], 0);
        assert_eq!(faded[15], 10000);
        assert_eq!(faded[48], 10000);
        // Untouched middle
        assert!(faded[16..48].iter().all(|&s| s == 10000));
        // Monotonic ramps
        assert!(faded[..16].windows(2).all(|w| w[0] <= w[1]));
        assert!(faded[48..].windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_telephony_path_is_faded() {
        let converter = converter();
        let speech = sine(720, 500.0, 24000.0, 12000.0);
        let out = converter.downsample_for_telephony(&speech).unwrap();
        assert_eq!(out.len(), 240);
        assert_eq!(out[0], 0);
        assert_eq!(out[239], 0);
    }
}

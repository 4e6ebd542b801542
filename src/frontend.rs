//! Spectral Frontend (spec.md §4.1): complex STFT / ISTFT shared by every
//! other component. Grounded on the teacher's `dsp/fft.rs` (Hann window,
//! thread-local `RealFftPlanner`, per-frame buffer reuse) and
//! `dsp/spectral_sub.rs` (overlap-add reconstruction with window-sum
//! normalization).

use crate::error::{Error, Result};
use realfft::num_complex::Complex;
use realfft::RealFftPlanner;
use std::cell::RefCell;
use std::collections::HashMap;

thread_local! {
    static FFT_PLANNER: RefCell<RealFftPlanner<f32>> = RefCell::new(RealFftPlanner::new());
    static HANN_CACHE: RefCell<HashMap<usize, Vec<f32>>> = RefCell::new(HashMap::new());
}

fn hann_window(size: usize) -> Vec<f32> {
    HANN_CACHE.with(|cache| {
        cache
            .borrow_mut()
            .entry(size)
            .or_insert_with(|| {
                (0..size)
                    .map(|i| {
                        0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (size - 1) as f32).cos())
                    })
                    .collect()
            })
            .clone()
    })
}

/// One STFT frame: magnitude and phase per frequency bin, bin 0 = DC.
#[derive(Clone, Debug)]
pub struct Frame {
    pub magnitude: Vec<f32>,
    pub phase: Vec<f32>,
}

/// The complex STFT of one channel: `F = n_fft/2 + 1` bins, `T` frames.
/// Frame-major storage (one `Frame` per time step) matches how every stage
/// of the Rewriter actually walks the data — frame by frame — while
/// `bin_hz` gives the per-bin frequency table spec.md §3 asks for.
#[derive(Clone, Debug)]
pub struct Spectrogram {
    pub frames: Vec<Frame>,
    pub bin_hz: Vec<f64>,
    pub n_fft: usize,
    pub hop: usize,
    pub sample_rate: u32,
}

impl Spectrogram {
    pub fn num_bins(&self) -> usize {
        self.bin_hz.len()
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    /// Bin-index range covering `[lo_hz, hi_hz)`, end-exclusive, clamped to
    /// the bin table. Returns `None` if the range is empty (e.g. Nyquist
    /// falls below `lo_hz`).
    pub fn bin_range(&self, lo_hz: f64, hi_hz: f64) -> Option<std::ops::Range<usize>> {
        let lo = self.bin_hz.partition_point(|&f| f < lo_hz);
        let hi = self.bin_hz.partition_point(|&f| f < hi_hz);
        if lo >= hi || lo >= self.bin_hz.len() {
            None
        } else {
            Some(lo..hi.min(self.bin_hz.len()))
        }
    }
}

/// Forward STFT: `(n_fft=2048, hop=512)` for analysis and rewriting, or
/// `(n_fft=1024, hop=1024)` for the low-resolution analyzer-only path
/// (spec.md §4.1). Fails with `InvalidSignal` if `signal.len() < n_fft`.
pub fn forward(signal: &[f32], sample_rate: u32, n_fft: usize, hop: usize) -> Result<Spectrogram> {
    if signal.len() < n_fft {
        return Err(Error::InvalidSignal(format!(
            "signal length {} shorter than n_fft {}",
            signal.len(),
            n_fft
        )));
    }

    let fft = FFT_PLANNER.with(|p| p.borrow_mut().plan_fft_forward(n_fft));
    let window = hann_window(n_fft);

    let mut input = fft.make_input_vec();
    let mut spectrum = fft.make_output_vec();

    let mut frames = Vec::new();
    let mut pos = 0;
    while pos + n_fft <= signal.len() {
        for (inp, (&s, &w)) in input.iter_mut().zip(signal[pos..pos + n_fft].iter().zip(window.iter())) {
            *inp = s * w;
        }
        fft.process(&mut input, &mut spectrum).expect("FFT failed");

        let mut magnitude = Vec::with_capacity(spectrum.len());
        let mut phase = Vec::with_capacity(spectrum.len());
        for c in spectrum.iter() {
            magnitude.push(c.norm());
            phase.push(c.arg());
        }
        frames.push(Frame { magnitude, phase });
        pos += hop;
    }

    let num_bins = n_fft / 2 + 1;
    let bin_hz: Vec<f64> = (0..num_bins)
        .map(|k| k as f64 * sample_rate as f64 / n_fft as f64)
        .collect();

    Ok(Spectrogram { frames, bin_hz, n_fft, hop, sample_rate })
}

/// Inverse STFT via overlap-add, reconstructing `M * exp(i*P)` per frame.
/// The caller pads or truncates the result to the original input length —
/// edge-effect truncation is the only difference `inverse(forward(x))`
/// should show versus `x` (spec.md §4.1).
pub fn inverse(spectrogram: &Spectrogram) -> Vec<f32> {
    let n_fft = spectrogram.n_fft;
    let hop = spectrogram.hop;
    if spectrogram.frames.is_empty() {
        return Vec::new();
    }

    let fft = FFT_PLANNER.with(|p| p.borrow_mut().plan_fft_inverse(n_fft));
    let window = hann_window(n_fft);

    let total_len = (spectrogram.frames.len() - 1) * hop + n_fft;
    let mut output = vec![0.0f32; total_len];
    let mut window_sum = vec![0.0f32; total_len];

    let mut spectrum = fft.make_input_vec();
    let mut time_out = fft.make_output_vec();

    for (frame_idx, frame) in spectrogram.frames.iter().enumerate() {
        for (c, (&mag, &ph)) in spectrum.iter_mut().zip(frame.magnitude.iter().zip(frame.phase.iter())) {
            *c = Complex::from_polar(mag, ph);
        }

        fft.process(&mut spectrum, &mut time_out).expect("inverse FFT failed");

        let pos = frame_idx * hop;
        let norm = 1.0 / n_fft as f32;
        for i in 0..n_fft {
            output[pos + i] += time_out[i] * norm * window[i];
            window_sum[pos + i] += window[i] * window[i];
        }
    }

    for i in 0..total_len {
        if window_sum[i] > 1e-6 {
            output[i] /= window_sum[i];
        }
    }

    output
}

/// Pad with zeros or truncate `samples` so its length matches `target_len`
/// exactly — the Rewriter's length-invariance guarantee (spec.md §8.2).
pub fn fit_to_length(mut samples: Vec<f32>, target_len: usize) -> Vec<f32> {
    if samples.len() < target_len {
        samples.resize(target_len, 0.0);
    } else {
        samples.truncate(target_len);
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_length_after_fit() {
        let sample_rate = 48_000u32;
        let n = 8192;
        let samples: Vec<f32> = (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * 440.0 * i as f64 / sample_rate as f64).sin() as f32)
            .collect();

        let spec = forward(&samples, sample_rate, 2048, 512).unwrap();
        let reconstructed = fit_to_length(inverse(&spec), samples.len());
        assert_eq!(reconstructed.len(), samples.len());

        // RMS should be close to the original (Hann/overlap-add round trip,
        // ignoring edge frames).
        let rms = |s: &[f32]| (s.iter().map(|x| (*x as f64).powi(2)).sum::<f64>() / s.len() as f64).sqrt();
        let rms_in = rms(&samples[2048..n - 2048]);
        let rms_out = rms(&reconstructed[2048..n - 2048]);
        assert!((rms_in - rms_out).abs() / rms_in < 0.1, "in={rms_in} out={rms_out}");
    }

    #[test]
    fn forward_fails_on_short_signal() {
        let samples = vec![0.0f32; 100];
        assert!(forward(&samples, 48_000, 2048, 512).is_err());
    }

    #[test]
    fn bin_hz_matches_formula() {
        let samples = vec![0.0f32; 4096];
        let spec = forward(&samples, 48_000, 2048, 512).unwrap();
        assert_eq!(spec.num_bins(), 1025);
        assert!((spec.bin_hz[1] - 48_000.0 / 2048.0).abs() < 1e-9);
    }

    #[test]
    fn bin_range_empty_above_nyquist() {
        let samples = vec![0.0f32; 4096];
        let spec = forward(&samples, 16_000, 2048, 512).unwrap();
        assert!(spec.bin_range(18_000.0, 22_000.0).is_none());
    }
}

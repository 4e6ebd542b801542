//! Band Accountant (spec.md §4.2): the single source of truth for "what is
//! the current ratio". Grounded on `original_source/.../analyze_fingerprint.py`
//! (band index masks, frame-by-frame ratio loop) and the teacher's
//! `dsp/notch.rs` (band-summary statistics computed via a running pass
//! rather than re-deriving everything per caller).

use crate::bands_hz;
use crate::frontend::{Frame, Spectrogram};
use std::ops::Range;

/// Frame-ratio values at or below this are treated as "no reference energy",
/// per spec.md §3's `mean(M[R, t]) > 10⁻¹⁰` gate.
pub const REFERENCE_SILENCE_EPS: f64 = 1e-10;

/// The thresholds whose frame-crossing percentages the Classifier consumes.
pub const CROSSING_THRESHOLDS: [f64; 5] = [0.10, 0.18, 0.25, 0.35, 0.50];

/// Mean magnitude of one frame restricted to a bin range.
pub fn frame_band_mean(frame: &Frame, range: &Range<usize>) -> f64 {
    if range.is_empty() {
        return 0.0;
    }
    let slice = &frame.magnitude[range.clone()];
    slice.iter().map(|&v| v as f64).sum::<f64>() / slice.len() as f64
}

/// Mean magnitude over a bin range across every frame — `mean(M[band, :])`.
pub fn band_mean(spectrogram: &Spectrogram, range: &Range<usize>) -> f64 {
    if range.is_empty() || spectrogram.frames.is_empty() {
        return 0.0;
    }
    let sum: f64 = spectrogram.frames.iter().map(|f| frame_band_mean(f, range)).sum();
    sum / spectrogram.frames.len() as f64
}

/// Distributional summary of a value series: mean, median, std, variance, max.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Distribution {
    pub mean: f64,
    pub median: f64,
    pub std: f64,
    pub variance: f64,
    pub max: f64,
}

impl Distribution {
    fn of(values: &[f64]) -> Self {
        if values.is_empty() {
            return Distribution::default();
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let std = variance.sqrt();
        let max = values.iter().cloned().fold(f64::MIN, f64::max);
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let median = if sorted.len() % 2 == 0 {
            (sorted[sorted.len() / 2 - 1] + sorted[sorted.len() / 2]) / 2.0
        } else {
            sorted[sorted.len() / 2]
        };
        Distribution { mean, median, std, variance, max }
    }
}

/// Full band accounting for one spectrogram: band means, the per-frame ratio
/// vector (both the sparse "valid frames only" series used for statistics
/// and the dense per-frame series stages index into), and threshold-crossing
/// percentages.
#[derive(Clone, Debug)]
pub struct BandAccountant {
    pub has_watermark_region: bool,
    pub has_reference_region: bool,
    pub watermark_range: Option<Range<usize>>,
    pub reference_range: Option<Range<usize>>,
    pub masking_range: Option<Range<usize>>,
    pub masking_source_range: Option<Range<usize>>,

    /// ρ = mean(M[W,:]) / mean(M[R,:]), 0 if R is empty or silent.
    pub ratio: f64,
    /// Per-frame ratios, dense: one entry per frame, `0.0` where the
    /// reference frame was silent (`mean(M[R,t]) <= 1e-10`).
    pub frame_ratios_dense: Vec<f64>,
    /// Per-frame ratios, sparse: only frames with reference energy above the
    /// silence threshold — what `Distribution::of` and the Classifier use.
    pub frame_ratios_valid: Vec<f64>,
    pub frame_ratio_stats: Distribution,
    /// `(threshold, percentage of valid frames above it)` pairs, in the
    /// order of `CROSSING_THRESHOLDS`.
    pub threshold_crossings: Vec<(f64, f64)>,
}

impl BandAccountant {
    /// Compute band accounting against the standard watermark/reference
    /// bands (spec.md §3). Downgrades gracefully when a band is empty
    /// (Nyquist below the band) per spec.md §4.2's edge-case rule.
    pub fn compute(spectrogram: &Spectrogram) -> Self {
        let w_range = spectrogram.bin_range(bands_hz::WATERMARK.0, bands_hz::WATERMARK.1);
        let r_range = spectrogram.bin_range(bands_hz::REFERENCE.0, bands_hz::REFERENCE.1);
        let m_range = spectrogram.bin_range(bands_hz::MASKING.0, bands_hz::MASKING.1);
        let ms_range = spectrogram.bin_range(bands_hz::MASKING_SOURCE.0, bands_hz::MASKING_SOURCE.1);

        let has_watermark_region = w_range.is_some();
        let has_reference_region = r_range.is_some();

        let energy_w = w_range.as_ref().map(|r| band_mean(spectrogram, r)).unwrap_or(0.0);
        let energy_r = r_range.as_ref().map(|r| band_mean(spectrogram, r)).unwrap_or(0.0);

        let ratio = if has_reference_region && energy_r > REFERENCE_SILENCE_EPS {
            energy_w / energy_r
        } else {
            0.0
        };

        let mut frame_ratios_dense = vec![0.0; spectrogram.num_frames()];
        let mut frame_ratios_valid = Vec::new();

        if let (Some(wr), Some(rr)) = (w_range.clone(), r_range.clone()) {
            for (t, frame) in spectrogram.frames.iter().enumerate() {
                let ref_mean = frame_band_mean(frame, &rr);
                if ref_mean > REFERENCE_SILENCE_EPS {
                    let wm_mean = frame_band_mean(frame, &wr);
                    let r = wm_mean / ref_mean;
                    frame_ratios_dense[t] = r;
                    frame_ratios_valid.push(r);
                }
            }
        }

        let frame_ratio_stats = Distribution::of(&frame_ratios_valid);

        let threshold_crossings = CROSSING_THRESHOLDS
            .iter()
            .map(|&t| {
                let pct = if frame_ratios_valid.is_empty() {
                    0.0
                } else {
                    100.0 * frame_ratios_valid.iter().filter(|&&r| r > t).count() as f64
                        / frame_ratios_valid.len() as f64
                };
                (t, pct)
            })
            .collect();

        BandAccountant {
            has_watermark_region,
            has_reference_region,
            watermark_range: w_range,
            reference_range: r_range,
            masking_range: m_range,
            masking_source_range: ms_range,
            ratio,
            frame_ratios_dense,
            frame_ratios_valid,
            frame_ratio_stats,
            threshold_crossings,
        }
    }

    /// Percentage of valid frames whose ratio exceeds `threshold`. Returns 0
    /// if `threshold` isn't one of `CROSSING_THRESHOLDS`.
    pub fn pct_above(&self, threshold: f64) -> f64 {
        self.threshold_crossings
            .iter()
            .find(|(t, _)| (*t - threshold).abs() < 1e-9)
            .map(|(_, pct)| *pct)
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::forward;

    fn sine(freq: f64, sample_rate: u32, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 / sample_rate as f64).sin() as f32)
            .collect()
    }

    #[test]
    fn clean_tone_has_near_zero_ratio() {
        let sr = 48_000;
        let samples = sine(440.0, sr, sr as usize * 2);
        let spec = forward(&samples, sr, 2048, 512).unwrap();
        let acc = BandAccountant::compute(&spec);
        assert!(acc.ratio < 0.05, "ratio={}", acc.ratio);
    }

    #[test]
    fn watermark_tone_has_high_ratio() {
        let sr = 48_000;
        let samples = sine(20_000.0, sr, sr as usize * 2);
        let spec = forward(&samples, sr, 2048, 512).unwrap();
        let acc = BandAccountant::compute(&spec);
        assert!(acc.ratio > 1.0, "ratio={}", acc.ratio);
    }

    #[test]
    fn empty_watermark_region_below_nyquist() {
        let sr = 32_000; // Nyquist 16 kHz < 18 kHz watermark band
        let samples = sine(440.0, sr, sr as usize * 2);
        let spec = forward(&samples, sr, 2048, 512).unwrap();
        let acc = BandAccountant::compute(&spec);
        assert!(!acc.has_watermark_region);
        assert_eq!(acc.ratio, 0.0);
        assert_eq!(acc.pct_above(0.10), 0.0);
    }
}

//! Analyzer (spec.md §4.4): runs the Spectral Frontend, Band Accountant,
//! and (optionally) the Feature Extractor over an input, derives the
//! auxiliary suspicion scores, and hands the Classifier its inputs to
//! produce a complete Metrics report.
//!
//! Grounded on `original_source/.../analyze_fingerprint.py`'s suspicion
//! formulas (triangular normalization score, pink-noise slope fit, filter
//! drop-off table) and the teacher's `dsp/harmonics.rs::compute_phase_coherence_summary`
//! for the phase-variance-based coherence measure.

use crate::bands::{BandAccountant, Distribution};
use crate::classifier::{self, ClassifierInputs, Status};
use crate::error::Result;
use crate::features::{self, FeatureSet};
use crate::frontend::{self, Spectrogram};
use crate::report::{Report, ThresholdCrossing};
use crate::signal::Signal;
use crate::{bands_hz, CLEAN_ZONE};

/// `analyze`'s caller-facing knobs (spec.md §6).
#[derive(Clone, Copy, Debug)]
pub struct AnalyzeOptions {
    pub n_fft: usize,
    pub include_features: bool,
    pub emit_image_hints: bool,
}

impl Default for AnalyzeOptions {
    fn default() -> Self {
        AnalyzeOptions { n_fft: 2048, include_features: true, emit_image_hints: false }
    }
}

/// Produce the Metrics report for `signal`'s first channel. Stereo callers
/// analyze each channel independently and reconcile as they see fit; the
/// core has no notion of a combined stereo metric (spec.md §4.8).
pub fn analyze(signal: &Signal, options: AnalyzeOptions) -> Result<Report> {
    let hop = if options.n_fft == 1024 { 1024 } else { 512 };
    let samples = signal.channel(0);

    if signal.nyquist() < bands_hz::WATERMARK.0 {
        return Ok(unsupported_sample_rate_report(signal));
    }

    let spectrogram = frontend::forward(samples, signal.sample_rate(), options.n_fft, hop)?;
    let accountant = BandAccountant::compute(&spectrogram);

    let (coh_w, coh_r) = phase_coherence(&spectrogram, &accountant);
    let coherence_ratio = if coh_r.abs() > 1e-12 { coh_w / coh_r } else { 0.0 };

    let normalization_suspicion = normalization_suspicion(accountant.ratio);
    let dithering_suspicion = dithering_suspicion(&spectrogram);
    let filter_artifact_suspicion = filter_artifact_suspicion(&spectrogram);

    let features = if options.include_features {
        features::extract(samples, signal.sample_rate()).ok()
    } else {
        None
    };
    let feature_scores = feature_suspicions(features.as_ref());

    let energy_suspicion = (accountant.pct_above(0.25) / 100.0 * 2.0).clamp(0.0, 1.0);
    let spectral_suspicion =
        (feature_scores.centroid + feature_scores.bandwidth + feature_scores.tempo) / 3.0;

    let combined_suspicion = 0.25 * energy_suspicion
        + 0.15 * coherence_suspicion(coherence_ratio)
        + 0.10 * normalization_suspicion
        + 0.10 * dithering_suspicion
        + 0.08 * filter_artifact_suspicion
        + 0.12 * feature_scores.mfcc
        + 0.08 * feature_scores.chroma
        + 0.05 * feature_scores.contrast
        + 0.05 * feature_scores.pitch
        + 0.04 * spectral_suspicion;

    let classifier_inputs = ClassifierInputs {
        ratio: accountant.ratio,
        max_frame_ratio: accountant.frame_ratio_stats.max,
        mean_frame_ratio: accountant.frame_ratio_stats.mean,
        frames_elevated_pct: accountant.pct_above(0.25),
        frames_higher_pct: accountant.pct_above(0.18),
        combined_suspicion,
    };
    let status = classifier::classify(&classifier_inputs);

    Ok(Report {
        ratio: accountant.ratio,
        mean_frame_ratio: accountant.frame_ratio_stats.mean,
        median_frame_ratio: accountant.frame_ratio_stats.median,
        max_frame_ratio: accountant.frame_ratio_stats.max,
        threshold_crossings: accountant
            .threshold_crossings
            .iter()
            .map(|&(threshold, percentage)| ThresholdCrossing { threshold, percentage })
            .collect(),
        phase_coherence_watermark: coh_w,
        phase_coherence_reference: coh_r,
        coherence_ratio,
        normalization_suspicion,
        dithering_suspicion,
        filter_artifact_suspicion,
        mfcc_suspicion: feature_scores.mfcc,
        chroma_suspicion: feature_scores.chroma,
        contrast_suspicion: feature_scores.contrast,
        pitch_suspicion: feature_scores.pitch,
        tempo_suspicion: feature_scores.tempo,
        centroid_suspicion: feature_scores.centroid,
        bandwidth_suspicion: feature_scores.bandwidth,
        combined_suspicion,
        sample_rate: signal.sample_rate(),
        duration_secs: signal.duration_secs(),
        nyquist_hz: signal.nyquist(),
        status,
        image_hint_columns: if options.emit_image_hints {
            Some(image_hint_columns(&spectrogram))
        } else {
            None
        },
    })
}

/// Downsamples the spectrogram into a coarse `[time][band]` magnitude grid
/// a caller can pass to an external renderer for a preview image — this
/// crate never rasterizes anything itself (spec.md §1 non-goals). Bands are
/// log-spaced octaves from 20 Hz to Nyquist; time is binned into at most
/// 512 columns so the hint stays small regardless of clip length.
fn image_hint_columns(spectrogram: &Spectrogram) -> Vec<Vec<f32>> {
    const MAX_COLUMNS: usize = 512;
    const NUM_BANDS: usize = 48;

    let nyquist = spectrogram.sample_rate as f64 / 2.0;
    let lo_hz = 20.0f64;
    let hi_hz = nyquist.max(lo_hz * 2.0);
    let octaves = (hi_hz / lo_hz).log2();

    let band_ranges: Vec<std::ops::Range<usize>> = (0..NUM_BANDS)
        .filter_map(|b| {
            let f_lo = lo_hz * 2f64.powf(octaves * b as f64 / NUM_BANDS as f64);
            let f_hi = lo_hz * 2f64.powf(octaves * (b + 1) as f64 / NUM_BANDS as f64);
            spectrogram.bin_range(f_lo, f_hi)
        })
        .collect();

    let num_frames = spectrogram.num_frames();
    let columns = num_frames.min(MAX_COLUMNS).max(1);
    let frames_per_column = (num_frames as f64 / columns as f64).ceil().max(1.0) as usize;

    (0..columns)
        .map(|c| {
            let start = c * frames_per_column;
            let end = (start + frames_per_column).min(num_frames);
            band_ranges
                .iter()
                .map(|range| {
                    if start >= end {
                        return 0.0;
                    }
                    let mut sum = 0.0f32;
                    let mut count = 0usize;
                    for frame in &spectrogram.frames[start..end] {
                        for &m in &frame.magnitude[range.clone()] {
                            sum += m;
                            count += 1;
                        }
                    }
                    if count > 0 { sum / count as f32 } else { 0.0 }
                })
                .collect()
        })
        .collect()
}

/// The `UnsupportedSampleRate` downgrade path (spec.md §7): Nyquist below
/// 18 kHz leaves the watermark band empty, so every watermark-derived
/// metric reports zero and the file is unconditionally clean.
fn unsupported_sample_rate_report(signal: &Signal) -> Report {
    Report {
        ratio: 0.0,
        mean_frame_ratio: 0.0,
        median_frame_ratio: 0.0,
        max_frame_ratio: 0.0,
        threshold_crossings: crate::bands::CROSSING_THRESHOLDS
            .iter()
            .map(|&threshold| ThresholdCrossing { threshold, percentage: 0.0 })
            .collect(),
        phase_coherence_watermark: 0.0,
        phase_coherence_reference: 0.0,
        coherence_ratio: 0.0,
        normalization_suspicion: 0.0,
        dithering_suspicion: 0.0,
        filter_artifact_suspicion: 0.0,
        mfcc_suspicion: 0.0,
        chroma_suspicion: 0.0,
        contrast_suspicion: 0.0,
        pitch_suspicion: 0.0,
        tempo_suspicion: 0.0,
        centroid_suspicion: 0.0,
        bandwidth_suspicion: 0.0,
        combined_suspicion: 0.0,
        sample_rate: signal.sample_rate(),
        duration_secs: signal.duration_secs(),
        nyquist_hz: signal.nyquist(),
        status: Status::Clean,
        image_hint_columns: None,
    }
}

fn variance_of(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64
}

fn std_of(values: &[f64]) -> f64 {
    variance_of(values).sqrt()
}

/// Per-frame cross-frequency variance of phase within a band, averaged
/// across frames, folded into a coherence score `1 / (1 + mean_variance)`.
fn band_coherence(spectrogram: &Spectrogram, range: &std::ops::Range<usize>) -> f64 {
    if range.is_empty() || spectrogram.frames.is_empty() {
        return 0.0;
    }
    let frame_variances: Vec<f64> = spectrogram
        .frames
        .iter()
        .map(|f| {
            let phases: Vec<f64> = f.phase[range.clone()].iter().map(|&p| p as f64).collect();
            variance_of(&phases)
        })
        .collect();
    let mean_variance = frame_variances.iter().sum::<f64>() / frame_variances.len() as f64;
    1.0 / (1.0 + mean_variance)
}

fn phase_coherence(spectrogram: &Spectrogram, accountant: &BandAccountant) -> (f64, f64) {
    let coh_w = accountant
        .watermark_range
        .as_ref()
        .map(|r| band_coherence(spectrogram, r))
        .unwrap_or(0.0);
    let coh_r = accountant
        .reference_range
        .as_ref()
        .map(|r| band_coherence(spectrogram, r))
        .unwrap_or(0.0);
    (coh_w, coh_r)
}

/// Low coherence ratio (watermark phase far more randomized than
/// reference phase) is itself evidence of deliberate phase randomization;
/// fold it into the combined score as `1 - min(ratio, 1)`.
fn coherence_suspicion(coherence_ratio: f64) -> f64 {
    (1.0 - coherence_ratio.min(1.0)).clamp(0.0, 1.0)
}

/// Triangular score peaking at ρ = 0.15 within [0.12, 0.18], 0 at the
/// edges; 0.8 below 0.12 (aggressive-filtering signature). The window's
/// lower edge (0.12) is deliberately not `CLEAN_ZONE.0` (0.11) — spec.md
/// §4.4 step 4 ties the 0.8 cutoff and the triangle's base to 0.12, one
/// hundredth above the clean zone's own floor.
fn normalization_suspicion(ratio: f64) -> f64 {
    const WINDOW_LO: f64 = 0.12;

    if ratio < WINDOW_LO {
        return 0.8;
    }
    if ratio > CLEAN_ZONE.1 {
        return 0.0;
    }
    if ratio <= 0.15 {
        (ratio - WINDOW_LO) / (0.15 - WINDOW_LO)
    } else {
        (CLEAN_ZONE.1 - ratio) / (CLEAN_ZONE.1 - 0.15)
    }
}

/// Least-squares slope of mean log-magnitude vs log-frequency over
/// 14-22 kHz; pink-noise character (slope ≈ -1) is a dithering signature.
fn dithering_suspicion(spectrogram: &Spectrogram) -> f64 {
    let Some(range) = spectrogram.bin_range(14_000.0, 22_000.0) else {
        return 0.0;
    };
    if range.len() < 2 {
        return 0.0;
    }

    let points: Vec<(f64, f64)> = range
        .clone()
        .filter(|&k| spectrogram.bin_hz[k] > 0.0)
        .map(|k| {
            let mean_mag: f64 = spectrogram.frames.iter().map(|f| f.magnitude[k] as f64).sum::<f64>()
                / spectrogram.frames.len().max(1) as f64;
            (spectrogram.bin_hz[k].ln(), mean_mag.max(1e-10).ln())
        })
        .collect();
    if points.len() < 2 {
        return 0.0;
    }

    let n = points.len() as f64;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
    let cov: f64 = points.iter().map(|(x, y)| (x - mean_x) * (y - mean_y)).sum();
    let var_x: f64 = points.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
    if var_x < 1e-12 {
        return 0.0;
    }
    let slope = cov / var_x;
    (1.0 - 2.0 * (slope + 1.0).abs()).max(0.0)
}

/// Energy-ratio drop-off across three slices below the watermark band.
fn filter_artifact_suspicion(spectrogram: &Spectrogram) -> f64 {
    let below_15k = spectrogram.bin_range(0.0, 15_000.0);
    let r_15_17 = spectrogram.bin_range(15_000.0, 17_000.0);
    let r_17_18 = spectrogram.bin_range(17_000.0, 18_000.0);

    let (Some(below), Some(mid), Some(high)) = (below_15k, r_15_17, r_17_18) else {
        return 0.0;
    };

    let e_below = crate::bands::band_mean(spectrogram, &below);
    if e_below < 1e-10 {
        return 0.0;
    }
    let ratio_mid = crate::bands::band_mean(spectrogram, &mid) / e_below;
    let ratio_high = crate::bands::band_mean(spectrogram, &high) / e_below;

    if ratio_mid < 0.3 && ratio_high < 0.1 {
        0.8
    } else if ratio_mid < 0.5 {
        0.5
    } else {
        0.0
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct FeatureSuspicions {
    mfcc: f64,
    chroma: f64,
    contrast: f64,
    pitch: f64,
    tempo: f64,
    centroid: f64,
    bandwidth: f64,
}

/// Lower variance/uniformity in a feature track reads as suspicious
/// (AI-generation pipelines tend to over-smooth these). Each component is a
/// clipped linear mapping of the relevant statistic into [0, 1].
fn feature_suspicions(features: Option<&FeatureSet>) -> FeatureSuspicions {
    let Some(features) = features else {
        return FeatureSuspicions::default();
    };

    let mfcc_values: Vec<f64> =
        features.mfcc.iter().flat_map(|frame| frame.iter().map(|&v| v as f64)).collect();
    let mfcc_variance = variance_of(&mfcc_values);
    let mfcc = (1.0 - mfcc_variance / 10.0).clamp(0.0, 1.0);

    let chroma_column_means: Vec<f64> = (0..12)
        .map(|pc| {
            features.chroma.iter().map(|c| c[pc] as f64).sum::<f64>() / features.chroma.len().max(1) as f64
        })
        .collect();
    let chroma_mean_std = std_of(&chroma_column_means);
    let chroma = (1.0 - chroma_mean_std / 0.1).clamp(0.0, 1.0);

    let contrast_values: Vec<f64> =
        features.contrast.iter().flat_map(|frame| frame.iter().map(|&v| v as f64)).collect();
    let contrast_mean = if contrast_values.is_empty() {
        0.0
    } else {
        contrast_values.iter().sum::<f64>() / contrast_values.len() as f64
    };
    let contrast_std = std_of(&contrast_values);
    let mut contrast = 0.0;
    if !(5.0..=20.0).contains(&contrast_mean) {
        contrast = 0.3;
    }
    if contrast_std < 2.0 {
        contrast = contrast.max(0.5);
    }

    let voiced_pitch: Vec<f64> = features.pitch.iter().copied().filter(|&p| p > 0.0).collect();
    let pitch_std = std_of(&voiced_pitch);
    let pitch = if voiced_pitch.is_empty() { 0.0 } else { (1.0 - pitch_std / 15.0).clamp(0.0, 1.0) };

    let nearest_integer_distance = (features.tempo_bpm - features.tempo_bpm.round()).abs();
    let tempo = if features.tempo_bpm > 0.0 && nearest_integer_distance < 0.5 { 0.2 } else { 0.0 };

    let centroid_std = std_of(&features.centroid);
    let centroid = (1.0 - centroid_std / 500.0).clamp(0.0, 1.0);

    let bandwidth_std = std_of(&features.bandwidth);
    let bandwidth = (1.0 - bandwidth_std / 1000.0).clamp(0.0, 1.0);

    FeatureSuspicions { mfcc, chroma, contrast, pitch, tempo, centroid, bandwidth }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_sum(freqs: &[f64], sample_rate: u32, n: usize, noise: f32) -> Vec<f32> {
        (0..n)
            .map(|i| {
                let t = i as f64 / sample_rate as f64;
                let mut s: f32 =
                    freqs.iter().map(|&f| (2.0 * std::f64::consts::PI * f * t).sin() as f32).sum();
                s += noise * (((i * 2654435761) as u32 as f32 / u32::MAX as f32) - 0.5);
                s / freqs.len() as f32
            })
            .collect()
    }

    #[test]
    fn clean_signal_reports_clean() {
        let sr = 48_000;
        let samples = sine_sum(&[440.0, 880.0, 1320.0], sr, sr as usize * 3, 0.01);
        let signal = Signal::mono(samples, sr).unwrap();
        let report = analyze(&signal, AnalyzeOptions::default()).unwrap();
        assert!(report.ratio < 0.05, "ratio={}", report.ratio);
        assert_eq!(report.status, Status::Clean);
    }

    #[test]
    fn watermarked_tone_reports_watermarked() {
        let sr = 48_000;
        let n = sr as usize * 2;
        let samples: Vec<f32> = (0..n)
            .map(|i| {
                let t = i as f64 / sr as f64;
                let fund = 0.1 * (2.0 * std::f64::consts::PI * 16_000.0 * t).sin();
                let wm = 0.1 * (2.0 * std::f64::consts::PI * 20_000.0 * t).sin();
                (fund + wm) as f32
            })
            .collect();
        let signal = Signal::mono(samples, sr).unwrap();
        let report = analyze(&signal, AnalyzeOptions::default()).unwrap();
        assert!(report.ratio > 0.5, "ratio={}", report.ratio);
        assert_eq!(report.status, Status::Watermarked);
    }

    #[test]
    fn low_sample_rate_reports_clean_with_zeroed_metrics() {
        let sr = 32_000; // Nyquist 16 kHz < 18 kHz
        let samples = sine_sum(&[440.0], sr, sr as usize * 2, 0.0);
        let signal = Signal::mono(samples, sr).unwrap();
        let report = analyze(&signal, AnalyzeOptions::default()).unwrap();
        assert_eq!(report.ratio, 0.0);
        assert_eq!(report.status, Status::Clean);
    }

    #[test]
    fn classifier_totality_holds_across_a_ratio_sweep() {
        for pct in 0..60 {
            let ratio = pct as f64 / 100.0;
            let inputs = ClassifierInputs { ratio, ..Default::default() };
            let status = classifier::classify(&inputs);
            assert!(matches!(
                status,
                Status::Clean | Status::Suspicious | Status::Watermarked | Status::PossiblyCleaned
            ));
        }
    }
}

//! Feature Extractor (spec.md §4.3): MFCCs, chroma, spectral contrast,
//! centroid, bandwidth, pitch track, and tempo for a time-domain signal.
//! Pure over `(signal, sample_rate)`.
//!
//! Grounded on the teacher's `dsp/chromagram.rs` (bin-to-pitch-class folding
//! via MIDI note numbers) and `dsp/harmonics.rs` (harmonic-product-spectrum
//! fundamental detection, spectral-flux onset envelope). The MFCC and
//! spectral-contrast routines are new but follow the same "precompute a
//! filterbank once, apply it per frame" shape the teacher uses for its Hann
//! window cache.

use crate::error::{Error, Result};
use crate::frontend::{self, Frame, Spectrogram};

/// Hop used by every Feature Extractor routine (spec.md §4.3).
pub const FEATURE_HOP: usize = 512;
/// FFT size shared with the main analysis/rewrite STFT configuration.
pub const FEATURE_NFFT: usize = 2048;

pub const NUM_MFCC: usize = 13;
const NUM_MEL_FILTERS: usize = 26;
const NUM_CONTRAST_BANDS: usize = 6;
/// Octave-spaced sub-band edges (Hz) for spectral contrast, clipped to Nyquist.
const CONTRAST_BAND_EDGES_HZ: [f64; NUM_CONTRAST_BANDS + 1] =
    [200.0, 400.0, 800.0, 1600.0, 3200.0, 6400.0, 12800.0];
const CONTRAST_QUANTILE: f64 = 0.02;

/// Full feature set for one signal, one frame per STFT hop.
#[derive(Clone, Debug)]
pub struct FeatureSet {
    pub mfcc: Vec<[f32; NUM_MFCC]>,
    pub chroma: Vec<[f32; 12]>,
    pub contrast: Vec<[f32; NUM_CONTRAST_BANDS]>,
    pub centroid: Vec<f64>,
    pub bandwidth: Vec<f64>,
    /// Frame-wise fundamental estimate in Hz; 0.0 where unvoiced.
    pub pitch: Vec<f64>,
    pub tempo_bpm: f64,
}

/// Compute the full feature set for `signal`. Fails with
/// `FeatureExtractionFailure` only when the signal is too short for even one
/// analysis frame — every per-frame routine below degrades to zero/empty
/// rather than panicking once the STFT itself succeeds.
pub fn extract(signal: &[f32], sample_rate: u32) -> Result<FeatureSet> {
    let spectrogram = frontend::forward(signal, sample_rate, FEATURE_NFFT, FEATURE_HOP)
        .map_err(|e| Error::FeatureExtractionFailure(e.to_string()))?;

    let mel_fb = mel_filterbank(NUM_MEL_FILTERS, FEATURE_NFFT, sample_rate);
    let mfcc = spectrogram
        .frames
        .iter()
        .map(|f| mfcc_for_frame(f, &mel_fb))
        .collect();

    let chroma = spectrogram
        .frames
        .iter()
        .map(|f| chroma_for_frame(f, &spectrogram.bin_hz))
        .collect();

    let contrast_edges = contrast_band_ranges(&spectrogram);
    let contrast = spectrogram
        .frames
        .iter()
        .map(|f| contrast_for_frame(f, &contrast_edges))
        .collect();

    let centroid = spectrogram
        .frames
        .iter()
        .map(|f| spectral_centroid(f, &spectrogram.bin_hz))
        .collect();

    let bandwidth: Vec<f64> = spectrogram
        .frames
        .iter()
        .zip(spectral_centroid_iter(&spectrogram))
        .map(|(f, c)| spectral_bandwidth(f, &spectrogram.bin_hz, c))
        .collect();

    let pitch = spectrogram
        .frames
        .iter()
        .map(|f| pitch_for_frame(f, &spectrogram.bin_hz))
        .collect();

    let tempo_bpm = estimate_tempo(&spectrogram);

    Ok(FeatureSet { mfcc, chroma, contrast, centroid, bandwidth, pitch, tempo_bpm })
}

fn spectral_centroid_iter(spectrogram: &Spectrogram) -> impl Iterator<Item = f64> + '_ {
    spectrogram.frames.iter().map(|f| spectral_centroid(f, &spectrogram.bin_hz))
}

// ---------------------------------------------------------------------------
// Mel / MFCC
// ---------------------------------------------------------------------------

fn hz_to_mel(f: f64) -> f64 {
    2595.0 * (1.0 + f / 700.0).log10()
}

fn mel_to_hz(m: f64) -> f64 {
    700.0 * (10f64.powf(m / 2595.0) - 1.0)
}

/// Triangular mel filterbank, one row of per-bin weights per filter.
fn mel_filterbank(num_filters: usize, n_fft: usize, sample_rate: u32) -> Vec<Vec<f32>> {
    let num_bins = n_fft / 2 + 1;
    let nyquist = sample_rate as f64 / 2.0;
    let mel_lo = hz_to_mel(0.0);
    let mel_hi = hz_to_mel(nyquist);

    let points: Vec<f64> = (0..num_filters + 2)
        .map(|i| mel_to_hz(mel_lo + (mel_hi - mel_lo) * i as f64 / (num_filters + 1) as f64))
        .collect();
    let bin_points: Vec<usize> = points
        .iter()
        .map(|&hz| ((hz / nyquist) * (num_bins - 1) as f64).round().clamp(0.0, (num_bins - 1) as f64) as usize)
        .collect();

    (0..num_filters)
        .map(|i| {
            let (lo, mid, hi) = (bin_points[i], bin_points[i + 1], bin_points[i + 2]);
            let mut weights = vec![0.0f32; num_bins];
            for b in lo..mid.max(lo + 1) {
                if mid > lo {
                    weights[b] = (b - lo) as f32 / (mid - lo) as f32;
                }
            }
            for b in mid..hi.max(mid + 1) {
                if b < num_bins && hi > mid {
                    weights[b] = (hi - b) as f32 / (hi - mid) as f32;
                }
            }
            weights
        })
        .collect()
}

fn mfcc_for_frame(frame: &Frame, mel_fb: &[Vec<f32>]) -> [f32; NUM_MFCC] {
    let log_energies: Vec<f32> = mel_fb
        .iter()
        .map(|filter| {
            let e: f32 = filter.iter().zip(frame.magnitude.iter()).map(|(&w, &m)| w * m).sum();
            e.max(1e-10).ln()
        })
        .collect();
    dct2_first_n(&log_energies)
}

/// DCT-II of `input`, keeping only the first `NUM_MFCC` coefficients.
fn dct2_first_n(input: &[f32]) -> [f32; NUM_MFCC] {
    let n = input.len() as f32;
    let mut out = [0.0f32; NUM_MFCC];
    for (k, slot) in out.iter_mut().enumerate() {
        let mut sum = 0.0f32;
        for (i, &x) in input.iter().enumerate() {
            sum += x * (std::f32::consts::PI / n * (i as f32 + 0.5) * k as f32).cos();
        }
        *slot = sum;
    }
    out
}

// ---------------------------------------------------------------------------
// Chroma — generalizes dsp/chromagram.rs's bin-to-pitch-class folding,
// dropping the per-octave detail this extractor doesn't need.
// ---------------------------------------------------------------------------

fn chroma_for_frame(frame: &Frame, bin_hz: &[f64]) -> [f32; 12] {
    let mut pitch_classes = [0.0f32; 12];
    for (bin_idx, (&mag, &freq)) in frame.magnitude.iter().zip(bin_hz.iter()).enumerate() {
        if bin_idx == 0 || freq < 16.35 || freq > 16744.0 {
            continue;
        }
        let midi = 69.0 + 12.0 * (freq / 440.0).log2();
        if !(0.0..=127.0).contains(&midi) {
            continue;
        }
        let pc = (midi.round() as usize) % 12;
        pitch_classes[pc] += mag * mag;
    }
    let total: f32 = pitch_classes.iter().sum();
    if total > 1e-12 {
        for v in pitch_classes.iter_mut() {
            *v /= total;
        }
    }
    pitch_classes
}

// ---------------------------------------------------------------------------
// Spectral contrast
// ---------------------------------------------------------------------------

fn contrast_band_ranges(spectrogram: &Spectrogram) -> Vec<std::ops::Range<usize>> {
    let mut edges = vec![0.0];
    edges.extend_from_slice(&CONTRAST_BAND_EDGES_HZ);
    (0..NUM_CONTRAST_BANDS)
        .map(|i| {
            spectrogram
                .bin_range(edges[i], edges[i + 1])
                .unwrap_or(0..0)
        })
        .collect()
}

fn contrast_for_frame(frame: &Frame, ranges: &[std::ops::Range<usize>]) -> [f32; NUM_CONTRAST_BANDS] {
    let mut out = [0.0f32; NUM_CONTRAST_BANDS];
    for (i, range) in ranges.iter().enumerate() {
        if range.is_empty() {
            continue;
        }
        let mut vals: Vec<f32> = frame.magnitude[range.clone()].to_vec();
        vals.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let n = vals.len();
        let k = ((n as f64 * CONTRAST_QUANTILE).ceil() as usize).clamp(1, n);
        let valley = vals[..k].iter().sum::<f32>() / k as f32;
        let peak = vals[n - k..].iter().sum::<f32>() / k as f32;
        out[i] = (peak.max(1e-10)).log10() - (valley.max(1e-10)).log10();
    }
    out
}

// ---------------------------------------------------------------------------
// Centroid / bandwidth — first and second spectral moments.
// ---------------------------------------------------------------------------

fn spectral_centroid(frame: &Frame, bin_hz: &[f64]) -> f64 {
    let total: f64 = frame.magnitude.iter().map(|&m| m as f64).sum();
    if total < 1e-12 {
        return 0.0;
    }
    let weighted: f64 = frame.magnitude.iter().zip(bin_hz.iter()).map(|(&m, &f)| m as f64 * f).sum();
    weighted / total
}

fn spectral_bandwidth(frame: &Frame, bin_hz: &[f64], centroid: f64) -> f64 {
    let total: f64 = frame.magnitude.iter().map(|&m| m as f64).sum();
    if total < 1e-12 {
        return 0.0;
    }
    let variance: f64 = frame
        .magnitude
        .iter()
        .zip(bin_hz.iter())
        .map(|(&m, &f)| m as f64 * (f - centroid).powi(2))
        .sum::<f64>()
        / total;
    variance.sqrt()
}

// ---------------------------------------------------------------------------
// Pitch track — per-frame harmonic-product-spectrum, generalizing the
// teacher's average-spectrum `detect_fundamental_hps`.
// ---------------------------------------------------------------------------

fn pitch_for_frame(frame: &Frame, bin_hz: &[f64]) -> f64 {
    let n = frame.magnitude.len();
    if n < 8 {
        return 0.0;
    }
    let total_energy: f32 = frame.magnitude.iter().sum();
    if total_energy < 1e-6 {
        return 0.0; // silent frame, unvoiced
    }

    let hps_len = n / 4;
    if hps_len < 2 {
        return 0.0;
    }
    let mut hps = vec![0.0f32; hps_len];
    for k in 1..hps_len {
        let k2 = (k * 2).min(n - 1);
        let k3 = (k * 3).min(n - 1);
        let k4 = (k * 4).min(n - 1);
        hps[k] = frame.magnitude[k] * frame.magnitude[k2] * frame.magnitude[k3] * frame.magnitude[k4];
    }
    let min_bin = (hps_len / 100).max(1);
    for v in hps.iter_mut().take(min_bin) {
        *v = 0.0;
    }

    let Some((peak_k, &peak_v)) = hps.iter().enumerate().max_by(|a, b| a.1.partial_cmp(b.1).unwrap()) else {
        return 0.0;
    };
    // Voicing gate: the HPS peak must stand well above the mean product floor.
    let mean_hps = hps.iter().sum::<f32>() / hps.len() as f32;
    if peak_k == 0 || peak_v <= mean_hps * 3.0 {
        return 0.0;
    }
    bin_hz[peak_k]
}

// ---------------------------------------------------------------------------
// Tempo — single BPM estimate via onset-flux autocorrelation.
// ---------------------------------------------------------------------------

const TEMPO_MIN_BPM: f64 = 60.0;
const TEMPO_MAX_BPM: f64 = 200.0;

fn spectral_flux(spectrogram: &Spectrogram) -> Vec<f32> {
    if spectrogram.num_frames() < 2 {
        return Vec::new();
    }
    (1..spectrogram.num_frames())
        .map(|t| {
            spectrogram.frames[t]
                .magnitude
                .iter()
                .zip(spectrogram.frames[t - 1].magnitude.iter())
                .map(|(&c, &p)| {
                    let diff = c - p;
                    if diff > 0.0 {
                        diff * diff
                    } else {
                        0.0
                    }
                })
                .sum::<f32>()
                .sqrt()
        })
        .collect()
}

fn estimate_tempo(spectrogram: &Spectrogram) -> f64 {
    let flux = spectral_flux(spectrogram);
    if flux.len() < 4 {
        return 0.0;
    }

    let frame_rate = spectrogram.sample_rate as f64 / spectrogram.hop as f64;
    let min_lag = (60.0 * frame_rate / TEMPO_MAX_BPM).floor().max(1.0) as usize;
    let max_lag = (60.0 * frame_rate / TEMPO_MIN_BPM).ceil() as usize;
    let max_lag = max_lag.min(flux.len().saturating_sub(1));
    if min_lag >= max_lag {
        return 0.0;
    }

    let mean: f32 = flux.iter().sum::<f32>() / flux.len() as f32;
    let centered: Vec<f32> = flux.iter().map(|&v| v - mean).collect();

    let mut best_lag = min_lag;
    let mut best_score = f32::MIN;
    for lag in min_lag..=max_lag {
        let score: f32 = centered[..centered.len() - lag]
            .iter()
            .zip(centered[lag..].iter())
            .map(|(&a, &b)| a * b)
            .sum();
        if score > best_score {
            best_score = score;
            best_lag = lag;
        }
    }
    if best_score <= 0.0 {
        return 0.0;
    }
    60.0 * frame_rate / best_lag as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, sample_rate: u32, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 / sample_rate as f64).sin() as f32)
            .collect()
    }

    #[test]
    fn extracts_features_for_a_simple_tone() {
        let sr = 48_000;
        let samples = sine(440.0, sr, sr as usize * 2);
        let features = extract(&samples, sr).unwrap();
        assert!(!features.mfcc.is_empty());
        assert_eq!(features.mfcc[0].len(), NUM_MFCC);
        assert_eq!(features.chroma[0].len(), 12);
        assert!(features.centroid.iter().all(|c| c.is_finite()));
        assert!(features.bandwidth.iter().all(|b| b.is_finite()));
    }

    #[test]
    fn fails_on_signal_shorter_than_nfft() {
        let samples = vec![0.0f32; 10];
        assert!(extract(&samples, 48_000).is_err());
    }

    #[test]
    fn pitch_track_detects_fundamental_near_input_tone() {
        let sr = 48_000;
        let samples = sine(220.0, sr, sr as usize * 2);
        let features = extract(&samples, sr).unwrap();
        let voiced: Vec<f64> = features.pitch.iter().copied().filter(|&p| p > 0.0).collect();
        assert!(!voiced.is_empty(), "expected some voiced frames");
        let mean_pitch = voiced.iter().sum::<f64>() / voiced.len() as f64;
        assert!((mean_pitch - 220.0).abs() < 50.0, "mean_pitch={mean_pitch}");
    }

    #[test]
    fn silence_is_unvoiced() {
        let samples = vec![0.0f32; 48_000 * 2];
        let features = extract(&samples, 48_000).unwrap();
        assert!(features.pitch.iter().all(|&p| p == 0.0));
    }
}

//! Rewriter — Master-STFT pipeline (spec.md §4.7, §4.8): one forward/inverse
//! STFT per channel, a fixed stage sequence mutating magnitude and phase in
//! place, a Reference Preservation hook between stages, time-domain
//! finishing, and optional humanization.
//!
//! Grounded on `remove_audio_fingerprint.py`'s stage sequence (band scaling,
//! phase blending, adaptive smoothing) and the teacher's
//! `dsp/spectral_sub.rs` (inverse-then-reforward detour, in-place stage
//! mutation). The safety-filter detour uses [`biquad::butterworth_lowpass_4th_order`];
//! opt-in humanization lives in [`humanize`].

pub mod biquad;
pub mod humanize;

use crate::bands::{band_mean, frame_band_mean, BandAccountant, REFERENCE_SILENCE_EPS};
use crate::bands_hz;
use crate::error::Result;
use crate::features;
use crate::frontend::{self, Spectrogram};
use crate::planner::{self, MinimalCase, Plan, PlanOverride, Severity};
use crate::signal::Signal;
use crate::REFERENCE_PRESERVATION_TOLERANCE;
use log::warn;
use rand::Rng;
use std::ops::Range;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Aggressiveness {
    Low,
    Medium,
    High,
}

impl Aggressiveness {
    fn at_least_medium(self) -> bool {
        self != Aggressiveness::Low
    }

    fn is_high(self) -> bool {
        self == Aggressiveness::High
    }
}

#[derive(Clone, Debug)]
pub struct RewriteOptions {
    pub aggressiveness: Aggressiveness,
    /// `h` in spec.md §4.7's statistical-pattern formulas, 0..1.
    pub humanizing_factor: f64,
    pub enable_humanization: bool,
    pub plan_override: Option<PlanOverride>,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        RewriteOptions {
            aggressiveness: Aggressiveness::Medium,
            humanizing_factor: 0.0,
            enable_humanization: false,
            plan_override: None,
        }
    }
}

/// The Planner's cheap pre-analysis, returned alongside the chosen plan so
/// callers can inspect why a severity was picked.
#[derive(Clone, Copy, Debug)]
pub struct PreAnalysis {
    pub ratio: f64,
    pub mean_frame_ratio: f64,
    pub max_frame_ratio: f64,
    pub severity: Severity,
    pub spikiness: f64,
}

struct BandRanges {
    watermark: Option<Range<usize>>,
    reference: Option<Range<usize>>,
    masking: Option<Range<usize>>,
    masking_source: Option<Range<usize>>,
}

impl BandRanges {
    fn from_accountant(accountant: &BandAccountant) -> Self {
        BandRanges {
            watermark: accountant.watermark_range.clone(),
            reference: accountant.reference_range.clone(),
            masking: accountant.masking_range.clone(),
            masking_source: accountant.masking_source_range.clone(),
        }
    }
}

/// Run the Rewriter on `signal`, returning the rewritten signal, the plan
/// that was used, and the pre-analysis that produced it.
pub fn rewrite(
    signal: &Signal,
    options: RewriteOptions,
    rng: &mut impl Rng,
) -> Result<(Signal, Plan, PreAnalysis)> {
    if signal.nyquist() < bands_hz::WATERMARK.0 {
        let pre = PreAnalysis { ratio: 0.0, mean_frame_ratio: 0.0, max_frame_ratio: 0.0, severity: Severity::Minimal, spikiness: 0.0 };
        let plan = minimal_skip_plan();
        let copy = Signal::from_processed_channels(signal.channels().to_vec(), signal.sample_rate());
        return Ok((copy, plan, pre));
    }

    let first_spectrogram = frontend::forward(signal.channel(0), signal.sample_rate(), 2048, 512)?;
    let accountant = BandAccountant::compute(&first_spectrogram);
    let fresh_plan = planner::plan(&first_spectrogram, &accountant, rng);

    let plan = match options.plan_override {
        Some(override_) => {
            let (merged, missing) = planner::merge_override(fresh_plan, override_);
            if !missing.is_empty() {
                warn!(
                    "{}",
                    crate::error::Error::PlanOverrideRejected(missing.join(", "))
                );
            }
            merged
        }
        None => fresh_plan,
    };

    let pre_analysis = PreAnalysis {
        ratio: accountant.ratio,
        mean_frame_ratio: accountant.frame_ratio_stats.mean,
        max_frame_ratio: accountant.frame_ratio_stats.max,
        severity: plan.severity,
        spikiness: planner::watermark_spikiness(&first_spectrogram, &accountant),
    };

    if plan.skip_rewrite {
        let copy = Signal::from_processed_channels(signal.channels().to_vec(), signal.sample_rate());
        return Ok((copy, plan, pre_analysis));
    }

    let mut out_channels = Vec::with_capacity(signal.num_channels());
    for ch in 0..signal.num_channels() {
        let original = signal.channel(ch);
        let processed = rewrite_channel(
            original,
            signal.sample_rate(),
            &plan,
            options.aggressiveness,
            options.humanizing_factor,
            rng,
        )?;
        out_channels.push(processed);
    }

    if signal.is_stereo() && options.aggressiveness.at_least_medium() {
        apply_stereo_imaging_variation(&mut out_channels, signal.sample_rate(), options.aggressiveness);
    }

    if signal.is_stereo() && options.enable_humanization {
        let (l, r) = humanize::stereo_image(&out_channels[0], &out_channels[1], signal.sample_rate());
        out_channels[0] = l;
        out_channels[1] = r;
    }

    if options.enable_humanization {
        for ch in out_channels.iter_mut() {
            let saturated = humanize::tanh_saturate(ch, 0.12);
            let with_room_tone = humanize::add_room_tone(&saturated, signal.sample_rate(), rng);
            *ch = humanize::parametric_eq(&with_room_tone, signal.sample_rate());
            for s in ch.iter_mut() {
                *s = s.clamp(-0.95, 0.95);
            }
        }
    }

    // Verification (spec.md §4.7): recompute ratio via a fresh STFT and log
    // the observation. Not a gate — the output is emitted regardless.
    if let Ok(verify_spectrogram) = frontend::forward(&out_channels[0], signal.sample_rate(), 2048, 512) {
        let verify = BandAccountant::compute(&verify_spectrogram);
        let within_tolerance = if plan.target_ratio > 1e-12 {
            (verify.ratio - plan.target_ratio).abs() / plan.target_ratio < 0.20
        } else {
            true
        };
        log::info!(
            "rewrite verification: ratio={:.4} target={:.4} below_0.15={} within_20pct={}",
            verify.ratio,
            plan.target_ratio,
            verify.ratio < 0.15,
            within_tolerance
        );
    }

    let out_signal = Signal::from_processed_channels(out_channels, signal.sample_rate());
    Ok((out_signal, plan, pre_analysis))
}

/// Slow-LFO pan curve applied to the stereo pair as a whole, after each
/// channel has already been rewritten independently (spec.md §4.8). Gains
/// are mirrored between channels and clipped to [0.95, 1.05]; in high mode
/// the right channel also gets a one-sample-delay blend at 1%.
const STEREO_PAN_LFO_HZ: f64 = 0.2;

fn apply_stereo_imaging_variation(channels: &mut [Vec<f32>], sample_rate: u32, aggressiveness: Aggressiveness) {
    if channels.len() != 2 {
        return;
    }
    let amplitude = if aggressiveness.is_high() { 0.02 } else { 0.01 };
    let n = channels[0].len().min(channels[1].len());

    for i in 0..n {
        let phase = 2.0 * std::f64::consts::PI * STEREO_PAN_LFO_HZ * i as f64 / sample_rate as f64;
        let lfo = phase.sin();
        let gain_l = (1.0 + amplitude * lfo).clamp(0.95, 1.05) as f32;
        let gain_r = (1.0 - amplitude * lfo).clamp(0.95, 1.05) as f32;
        channels[0][i] = (channels[0][i] * gain_l).clamp(-0.95, 0.95);
        channels[1][i] = (channels[1][i] * gain_r).clamp(-0.95, 0.95);
    }

    if aggressiveness.is_high() {
        let right = channels[1].clone();
        for i in (1..n).rev() {
            channels[1][i] = (0.99 * right[i] + 0.01 * right[i - 1]).clamp(-0.95, 0.95);
        }
    }
}

fn minimal_skip_plan() -> Plan {
    Plan {
        severity: Severity::Minimal,
        target_ratio: 0.15,
        masking_strength: 0.005,
        phase_mix: 0.2,
        smoothing_min: 0.1,
        smoothing_max: 0.7,
        masking_variation: 0.03,
        targets_clean_zone: true,
        skip_rewrite: true,
    }
}

fn rewrite_channel(
    original: &[f32],
    sample_rate: u32,
    plan: &Plan,
    aggressiveness: Aggressiveness,
    humanizing_factor: f64,
    rng: &mut impl Rng,
) -> Result<Vec<f32>> {
    let input_len = original.len();

    let mut spectrogram = frontend::forward(original, sample_rate, 2048, 512)?;
    let accountant = BandAccountant::compute(&spectrogram);
    let ranges = BandRanges::from_accountant(&accountant);
    let baseline_reference_energy = ranges
        .reference
        .as_ref()
        .map(|r| band_mean(&spectrogram, r))
        .unwrap_or(0.0);

    stage0_outlier_clamp(&mut spectrogram, &ranges);
    preserve_reference(&mut spectrogram, &ranges.reference, baseline_reference_energy);

    spectrogram = stage1_selective_filtering(spectrogram, &ranges, plan, sample_rate)?;
    preserve_reference(&mut spectrogram, &ranges.reference, baseline_reference_energy);

    if aggressiveness.at_least_medium() {
        stage2_phase_modification(&mut spectrogram, &ranges, plan, rng);
        preserve_reference(&mut spectrogram, &ranges.reference, baseline_reference_energy);

        stage3_spectral_normalization(&mut spectrogram, &ranges, plan);
        preserve_reference(&mut spectrogram, &ranges.reference, baseline_reference_energy);
    }

    if aggressiveness.is_high() {
        stage4_aggressive_removal_and_masking(&mut spectrogram, &ranges, plan, rng);
        preserve_reference(&mut spectrogram, &ranges.reference, baseline_reference_energy);
    }

    if aggressiveness.at_least_medium() {
        stage5_adaptive_smoothing(&mut spectrogram, &ranges, plan);
        preserve_reference(&mut spectrogram, &ranges.reference, baseline_reference_energy);

        stage6_feature_preservation(&mut spectrogram, &ranges, plan, original, sample_rate);
        preserve_reference(&mut spectrogram, &ranges.reference, baseline_reference_energy);
    }

    let mut reconstructed = frontend::fit_to_length(frontend::inverse(&spectrogram), input_len);

    if aggressiveness.is_high() {
        stage7_final_naturalization(&mut reconstructed, rng);
    }

    volume_normalize(&mut reconstructed, original);

    if aggressiveness.at_least_medium() {
        apply_statistical_patterns(
            &mut reconstructed,
            original,
            sample_rate,
            plan,
            aggressiveness,
            humanizing_factor,
            rng,
        );
    }

    for s in reconstructed.iter_mut() {
        *s = s.clamp(-0.95, 0.95);
    }

    Ok(reconstructed)
}

/// Reference Preservation hook: if `mean(M[R,:])` has dropped by more than
/// `REFERENCE_PRESERVATION_TOLERANCE` since the baseline, scale `M[R,:]` up
/// by at most 1.5x toward the baseline.
fn preserve_reference(spectrogram: &mut Spectrogram, reference: &Option<Range<usize>>, baseline: f64) {
    let Some(range) = reference else { return };
    if baseline < REFERENCE_SILENCE_EPS {
        return;
    }
    let current = band_mean(spectrogram, range);
    let floor = (1.0 - REFERENCE_PRESERVATION_TOLERANCE) * baseline;
    if current >= floor || current < REFERENCE_SILENCE_EPS {
        return;
    }
    let needed = (baseline / current).min(1.5);
    for frame in spectrogram.frames.iter_mut() {
        for bin in range.clone() {
            frame.magnitude[bin] = (frame.magnitude[bin] as f64 * needed) as f32;
        }
    }
}

fn frame_ratio(frame: &crate::frontend::Frame, w: &Range<usize>, r: &Range<usize>) -> f64 {
    let ref_mean = frame_band_mean(frame, r);
    if ref_mean > REFERENCE_SILENCE_EPS {
        frame_band_mean(frame, w) / ref_mean
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Stage 0 — outlier clamp (always)
// ---------------------------------------------------------------------------

fn stage0_outlier_clamp(spectrogram: &mut Spectrogram, ranges: &BandRanges) {
    let (Some(w), Some(r)) = (ranges.watermark.clone(), ranges.reference.clone()) else { return };
    for frame in spectrogram.frames.iter_mut() {
        let ratio = frame_ratio(frame, &w, &r);
        if ratio > 10.0 {
            let scale = (2.0 / ratio) as f32;
            for bin in w.clone() {
                frame.magnitude[bin] *= scale;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Stage 1 — selective filtering (always), with the safety-filter detour
// ---------------------------------------------------------------------------

fn stage1_selective_filtering(
    mut spectrogram: Spectrogram,
    ranges: &BandRanges,
    plan: &Plan,
    sample_rate: u32,
) -> Result<Spectrogram> {
    let factor = if plan.targets_clean_zone { 0.70 } else { 0.18 } as f32;
    if let Some(w) = ranges.watermark.clone() {
        for frame in spectrogram.frames.iter_mut() {
            for bin in w.clone() {
                frame.magnitude[bin] *= factor;
            }
        }
    }

    if let Some(edge) = spectrogram.bin_range(17_500.0, 18_000.0) {
        let n = edge.len().max(1);
        for frame in spectrogram.frames.iter_mut() {
            for (i, bin) in edge.clone().enumerate() {
                let rolloff = 1.0 - 0.02 * (i as f32 / n as f32);
                frame.magnitude[bin] *= rolloff;
            }
        }
    }

    // Safety filter: detour through the time domain to clean up residual
    // aliasing from the brute-force band scaling above.
    let time_domain = frontend::inverse(&spectrogram);
    let filtered = biquad::butterworth_lowpass_4th_order(&time_domain, 18_500.0, sample_rate);
    frontend::forward(&filtered, sample_rate, spectrogram.n_fft, spectrogram.hop)
}

// ---------------------------------------------------------------------------
// Stage 2 — phase modification (medium/high)
// ---------------------------------------------------------------------------

fn stage2_phase_modification(spectrogram: &mut Spectrogram, ranges: &BandRanges, plan: &Plan, rng: &mut impl Rng) {
    let Some(w) = ranges.watermark.clone() else { return };
    let mix = plan.phase_mix as f32;
    for frame in spectrogram.frames.iter_mut() {
        for bin in w.clone() {
            let draw: f32 = rng.random_range((-std::f32::consts::PI / 3.0)..(std::f32::consts::PI / 3.0));
            frame.phase[bin] = (1.0 - mix) * frame.phase[bin] + mix * draw;
        }
    }
}

// ---------------------------------------------------------------------------
// Stage 3 — spectral normalization (medium/high)
// ---------------------------------------------------------------------------

fn stage3_spectral_normalization(spectrogram: &mut Spectrogram, ranges: &BandRanges, plan: &Plan) {
    let (Some(w), Some(r)) = (ranges.watermark.clone(), ranges.reference.clone()) else { return };

    let e_w = band_mean(spectrogram, &w);
    let e_r = band_mean(spectrogram, &r);
    let ratio = if e_r > REFERENCE_SILENCE_EPS { e_w / e_r } else { 0.0 };

    if ratio < 0.12 && !plan.targets_clean_zone {
        return;
    }

    if plan.targets_clean_zone {
        let needs_increase_threshold = 0.8 * plan.target_ratio;
        let mut sum_w = 0.0;
        let mut sum_r = 0.0;
        let mut indices = Vec::new();
        for (t, frame) in spectrogram.frames.iter().enumerate() {
            let ft_ratio = frame_ratio(frame, &w, &r);
            if ft_ratio < needs_increase_threshold {
                sum_w += frame_band_mean(frame, &w);
                sum_r += frame_band_mean(frame, &r);
                indices.push(t);
            }
        }
        if indices.is_empty() || sum_w < 1e-12 {
            return;
        }
        let alpha = (plan.target_ratio * sum_r / sum_w).clamp(0.001, 100.0) as f32;
        for &t in &indices {
            for bin in w.clone() {
                spectrogram.frames[t].magnitude[bin] *= alpha;
            }
        }
    } else {
        if e_w < 1e-12 {
            return;
        }
        let alpha = (plan.target_ratio * e_r / e_w).clamp(0.001, 2.0) as f32;
        for frame in spectrogram.frames.iter_mut() {
            for bin in w.clone() {
                frame.magnitude[bin] *= alpha;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Stage 4 — aggressive removal + natural masking (high only)
// ---------------------------------------------------------------------------

fn stage4_aggressive_removal_and_masking(
    spectrogram: &mut Spectrogram,
    ranges: &BandRanges,
    plan: &Plan,
    rng: &mut impl Rng,
) {
    let (Some(w), Some(r)) = (ranges.watermark.clone(), ranges.reference.clone()) else { return };

    let e_w = band_mean(spectrogram, &w);
    let e_r = band_mean(spectrogram, &r);
    let ratio = if e_r > REFERENCE_SILENCE_EPS { e_w / e_r } else { 0.0 };
    let target = if plan.targets_clean_zone { plan.target_ratio } else { 0.9 * plan.target_ratio };

    if ratio > target && e_w > 1e-12 {
        let scale = (target * e_r / e_w).max(0.001) as f32;
        for frame in spectrogram.frames.iter_mut() {
            for bin in w.clone() {
                frame.magnitude[bin] *= scale;
            }
        }
    }

    let post_e_w = band_mean(spectrogram, &w);
    let post_ratio = if e_r > REFERENCE_SILENCE_EPS { post_e_w / e_r } else { 0.0 };
    if post_ratio < 0.12 {
        return;
    }

    let (Some(masking), Some(masking_source)) = (ranges.masking.clone(), ranges.masking_source.clone()) else {
        return;
    };
    let n = masking.len().max(1);
    for frame in spectrogram.frames.iter_mut() {
        let source_energy = frame_band_mean(frame, &masking_source) as f32;
        for (i, bin) in masking.clone().enumerate() {
            let gradient = 0.005 + 0.005 * (i as f32 / n as f32);
            let variation: f32 = rng.random_range((1.0 - plan.masking_variation as f32)..(1.0 + plan.masking_variation as f32));
            let floor = source_energy * plan.masking_strength as f32 * gradient * variation;
            frame.magnitude[bin] = frame.magnitude[bin].max(floor);
        }
    }
}

// ---------------------------------------------------------------------------
// Stage 5 — adaptive smoothing (medium/high)
// ---------------------------------------------------------------------------

fn stage5_adaptive_smoothing(spectrogram: &mut Spectrogram, ranges: &BandRanges, plan: &Plan) {
    let Some(w) = ranges.watermark.clone() else { return };
    if w.len() < 3 {
        return;
    }

    for frame in spectrogram.frames.iter_mut() {
        let pre_smoothing = frame.magnitude[w.clone()].to_vec();
        let local_variances: Vec<f32> = (0..pre_smoothing.len())
            .map(|i| {
                let lo = i.saturating_sub(1);
                let hi = (i + 1).min(pre_smoothing.len() - 1);
                let slice = &pre_smoothing[lo..=hi];
                let mean = slice.iter().sum::<f32>() / slice.len() as f32;
                slice.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / slice.len() as f32
            })
            .collect();
        let max_var = local_variances.iter().cloned().fold(0.0f32, f32::max).max(1e-12);
        let normalized_variance: Vec<f32> = local_variances.iter().map(|&v| v / max_var).collect();

        let mut smoothed = pre_smoothing.clone();
        for i in 0..pre_smoothing.len() {
            let lo = i.saturating_sub(1);
            let hi = (i + 1).min(pre_smoothing.len() - 1);
            let avg = pre_smoothing[lo..=hi].iter().sum::<f32>() / (hi - lo + 1) as f32;
            let strength =
                (1.0 - normalized_variance[i]).clamp(plan.smoothing_min as f32, plan.smoothing_max as f32);
            smoothed[i] = (1.0 - strength) * pre_smoothing[i] + strength * avg;
        }

        for (bin, (&pre, smooth)) in w.clone().zip(pre_smoothing.iter().zip(smoothed.iter())) {
            frame.magnitude[bin] = pre.min(*smooth);
        }
    }
}

// ---------------------------------------------------------------------------
// Stage 6 — feature preservation (medium/high)
// ---------------------------------------------------------------------------

fn stage6_feature_preservation(
    spectrogram: &mut Spectrogram,
    ranges: &BandRanges,
    plan: &Plan,
    original: &[f32],
    sample_rate: u32,
) {
    let Some(below_15k) = spectrogram.bin_range(0.0, 15_000.0) else { return };

    let processed_preview = frontend::fit_to_length(frontend::inverse(spectrogram), original.len());

    let (Ok(original_features), Ok(processed_features)) =
        (features::extract(original, sample_rate), features::extract(&processed_preview, sample_rate))
    else {
        return;
    };

    let mean_of = |v: &[f64]| -> f64 {
        if v.is_empty() {
            0.0
        } else {
            v.iter().sum::<f64>() / v.len() as f64
        }
    };
    let relative_deviation = |a: f64, b: f64| -> f64 {
        if a.abs() < 1e-12 {
            0.0
        } else {
            (b - a).abs() / a.abs()
        }
    };

    let centroid_dev = relative_deviation(mean_of(&original_features.centroid), mean_of(&processed_features.centroid));
    let bandwidth_dev = relative_deviation(mean_of(&original_features.bandwidth), mean_of(&processed_features.bandwidth));

    let mfcc_mean = |fs: &[[f32; features::NUM_MFCC]]| -> f64 {
        if fs.is_empty() {
            return 0.0;
        }
        fs.iter().flat_map(|c| c.iter()).map(|&v| v as f64).sum::<f64>() / (fs.len() * features::NUM_MFCC) as f64
    };
    let mfcc_dev = relative_deviation(mfcc_mean(&original_features.mfcc), mfcc_mean(&processed_features.mfcc));

    let chroma_mean = |fs: &[[f32; 12]]| -> f64 {
        if fs.is_empty() {
            return 0.0;
        }
        fs.iter().flat_map(|c| c.iter()).map(|&v| v as f64).sum::<f64>() / (fs.len() * 12) as f64
    };
    let chroma_dev = relative_deviation(chroma_mean(&original_features.chroma), chroma_mean(&processed_features.chroma));

    let contrast_mean = |fs: &[[f32; 6]]| -> f64 {
        if fs.is_empty() {
            return 0.0;
        }
        fs.iter().flat_map(|c| c.iter()).map(|&v| v as f64).sum::<f64>() / (fs.len() * 6) as f64
    };
    let contrast_dev =
        relative_deviation(contrast_mean(&original_features.contrast), contrast_mean(&processed_features.contrast));

    let mut scale = 1.0f32;
    if centroid_dev > 0.03 || bandwidth_dev > 0.03 {
        scale *= 1.0 + (centroid_dev.max(bandwidth_dev) * 0.1) as f32;
        scale = scale.clamp(0.97, 1.03);
    }
    if mfcc_dev > 0.05 {
        scale = (scale * (1.0 + mfcc_dev as f32 * 0.1)).clamp(0.95, 1.05);
    }
    if chroma_dev > 0.05 || contrast_dev > 0.05 {
        scale = (scale * (1.0 + chroma_dev.max(contrast_dev) as f32 * 0.1)).clamp(0.97, 1.03);
    }

    if (scale - 1.0).abs() > 1e-6 {
        for frame in spectrogram.frames.iter_mut() {
            for bin in below_15k.clone() {
                frame.magnitude[bin] *= scale;
            }
        }
    }

    let chroma_column_means: Vec<f64> = (0..12)
        .map(|pc| {
            original_features.chroma.iter().map(|c| c[pc] as f64).sum::<f64>()
                / original_features.chroma.len().max(1) as f64
        })
        .collect();
    let chroma_mean_std = {
        let mean = chroma_column_means.iter().sum::<f64>() / 12.0;
        (chroma_column_means.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / 12.0).sqrt()
    };
    let chroma_variance = {
        let values: Vec<f64> =
            original_features.chroma.iter().flat_map(|c| c.iter().map(|&v| v as f64)).collect();
        let mean = values.iter().sum::<f64>() / values.len().max(1) as f64;
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len().max(1) as f64
    };

    if chroma_mean_std < 0.05 || chroma_variance < 0.5 {
        let amplitude = plan.masking_variation as f32;
        let num_frames = spectrogram.num_frames().max(1);
        for (t, frame) in spectrogram.frames.iter_mut().enumerate() {
            for bin in below_15k.clone() {
                let phase_term = 2.0 * std::f32::consts::PI
                    * (t as f32 / num_frames as f32 + bin as f32 / below_15k.len().max(1) as f32);
                let variation = 1.0 + amplitude * phase_term.sin();
                frame.magnitude[bin] *= variation;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Stage 7 — final naturalization (high only)
// ---------------------------------------------------------------------------

fn stage7_final_naturalization(samples: &mut [f32], rng: &mut impl Rng) {
    for s in samples.iter_mut() {
        let gain: f32 = rng.random_range(0.998..1.002);
        *s *= gain;
    }
}

// ---------------------------------------------------------------------------
// Post-pipeline: volume normalization (always)
// ---------------------------------------------------------------------------

fn rms(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|&x| (x as f64).powi(2)).sum::<f64>() / samples.len() as f64).sqrt()
}

fn volume_normalize(processed: &mut [f32], original: &[f32]) {
    let rms_in = rms(original);
    let rms_out = rms(processed);
    if rms_out < 1e-12 {
        return;
    }
    let gain = (rms_in / rms_out) as f32;
    for s in processed.iter_mut() {
        *s *= gain;
        *s = s.clamp(-0.95, 0.95);
    }
}

// ---------------------------------------------------------------------------
// Post-pipeline: statistical patterns (medium/high)
// ---------------------------------------------------------------------------

fn apply_statistical_patterns(
    processed: &mut Vec<f32>,
    original: &[f32],
    sample_rate: u32,
    plan: &Plan,
    aggressiveness: Aggressiveness,
    humanizing_factor: f64,
    rng: &mut impl Rng,
) {
    let h = humanizing_factor.clamp(0.0, 1.0);
    timing_jitter(processed, h, rng);
    amplitude_nonlinearity(processed, aggressiveness);

    if aggressiveness.is_high() {
        soft_clip(processed);
    }

    tempo_correction(processed, sample_rate, aggressiveness, h);
    unified_pitch_timing(processed, original, sample_rate, h, rng);

    let target_len = original.len();
    *processed = frontend::fit_to_length(std::mem::take(processed), target_len);
}

fn timing_jitter(samples: &mut [f32], h: f64, rng: &mut impl Rng) {
    let bound = (0.002 * h) as f32;
    if bound <= 0.0 {
        return;
    }
    for s in samples.iter_mut() {
        let jitter: f32 = rng.random_range((1.0 - bound)..(1.0 + bound));
        *s *= jitter;
    }
}

fn amplitude_nonlinearity(samples: &mut [f32], aggressiveness: Aggressiveness) {
    let coeff = if aggressiveness.is_high() { 0.05 } else { 0.02 };
    for s in samples.iter_mut() {
        let gain = (1.0 + coeff * (*s as f64).powi(2)).clamp(0.95, 1.05) as f32;
        *s *= gain;
    }
}

fn soft_clip(samples: &mut [f32]) {
    for s in samples.iter_mut() {
        *s += 0.01 * (0.5 * *s).tanh();
        *s = s.clamp(-0.95, 0.95);
    }
}

fn linear_resample(samples: &[f32], factor: f64) -> Vec<f32> {
    if samples.is_empty() || (factor - 1.0).abs() < 1e-9 {
        return samples.to_vec();
    }
    let out_len = ((samples.len() as f64) * factor).round().max(1.0) as usize;
    (0..out_len)
        .map(|i| {
            let src_pos = i as f64 / factor;
            let lo = src_pos.floor() as usize;
            let hi = (lo + 1).min(samples.len() - 1);
            let frac = (src_pos - lo as f64) as f32;
            samples[lo.min(samples.len() - 1)] * (1.0 - frac) + samples[hi] * frac
        })
        .collect()
}

fn tempo_correction(samples: &mut Vec<f32>, sample_rate: u32, aggressiveness: Aggressiveness, h: f64) {
    let Ok(fs) = features::extract(samples, sample_rate) else { return };
    if fs.tempo_bpm <= 0.0 || (fs.tempo_bpm - fs.tempo_bpm.round()).abs() >= 0.5 {
        return;
    }
    let bound = if aggressiveness.is_high() { 0.005 } else { 0.003 };
    let factor = 1.0 + bound * h; // nudge away from the quantized tempo, scaled by h
    if (factor - 1.0).abs() < 1e-9 {
        return;
    }
    let original_len = samples.len();
    *samples = frontend::fit_to_length(linear_resample(samples, factor), original_len);
}

fn unified_pitch_timing(
    samples: &mut Vec<f32>,
    original: &[f32],
    sample_rate: u32,
    h: f64,
    rng: &mut impl Rng,
) {
    let (Ok(orig_features), Ok(proc_features)) =
        (features::extract(original, sample_rate), features::extract(samples, sample_rate))
    else {
        return;
    };

    let voiced = |p: &[f64]| -> Vec<f64> { p.iter().copied().filter(|&v| v > 0.0).collect() };
    let orig_voiced = voiced(&orig_features.pitch);
    let proc_voiced = voiced(&proc_features.pitch);
    if orig_voiced.is_empty() || proc_voiced.is_empty() {
        return;
    }
    let mean = |v: &[f64]| v.iter().sum::<f64>() / v.len() as f64;
    let orig_mean = mean(&orig_voiced);
    let proc_mean = mean(&proc_voiced);
    if orig_mean < 1e-9 {
        return;
    }
    let ratio = proc_mean / orig_mean;

    let delta_t: f64 = rng.random_range(-0.002..0.002);

    let factor = if (ratio - 1.0).abs() > 0.015 {
        (1.0 / ratio).clamp(0.99, 1.01) * (1.0 + delta_t * h)
    } else {
        let std = {
            let m = mean(&proc_voiced);
            (proc_voiced.iter().map(|v| (v - m).powi(2)).sum::<f64>() / proc_voiced.len() as f64).sqrt()
        };
        if std < 15.0 {
            1.0 + delta_t * h
        } else {
            1.0
        }
    };

    if (factor - 1.0).abs() > 1e-9 {
        let original_len = samples.len();
        *samples = frontend::fit_to_length(linear_resample(samples, factor), original_len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn sine_sum(freqs: &[(f64, f32)], sample_rate: u32, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| {
                let t = i as f64 / sample_rate as f64;
                freqs.iter().map(|&(f, a)| a * (2.0 * std::f64::consts::PI * f * t).sin() as f32).sum()
            })
            .collect()
    }

    #[test]
    fn length_invariance_holds_per_channel() {
        let sr = 48_000;
        let n = sr as usize * 2;
        let samples = sine_sum(&[(440.0, 0.3), (20_000.0, 0.3)], sr, n);
        let signal = Signal::mono(samples, sr).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let options = RewriteOptions { aggressiveness: Aggressiveness::High, ..Default::default() };
        let (out, _, _) = rewrite(&signal, options, &mut rng).unwrap();
        assert_eq!(out.len(), signal.len());
    }

    #[test]
    fn amplitude_bound_holds() {
        let sr = 48_000;
        let n = sr as usize * 2;
        let samples = sine_sum(&[(440.0, 0.3), (20_000.0, 0.3)], sr, n);
        let signal = Signal::mono(samples, sr).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let options = RewriteOptions { aggressiveness: Aggressiveness::High, ..Default::default() };
        let (out, _, _) = rewrite(&signal, options, &mut rng).unwrap();
        assert!(out.channel(0).iter().all(|&x| x.abs() <= 0.95 + 1e-4));
    }

    #[test]
    fn clean_signal_is_skipped_bit_identically() {
        let sr = 48_000;
        let n = sr as usize * 2;
        let samples = sine_sum(&[(440.0, 0.3), (880.0, 0.2), (1320.0, 0.1)], sr, n);
        let signal = Signal::mono(samples.clone(), sr).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let options = RewriteOptions::default();
        let (out, plan, _) = rewrite(&signal, options, &mut rng).unwrap();
        if plan.skip_rewrite {
            assert_eq!(out.channel(0), samples.as_slice());
        }
    }

    #[test]
    fn unsupported_sample_rate_copies_input_unchanged() {
        let sr = 32_000;
        let samples = sine_sum(&[(440.0, 0.3)], sr, sr as usize * 2);
        let signal = Signal::mono(samples.clone(), sr).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let (out, plan, _) = rewrite(&signal, RewriteOptions::default(), &mut rng).unwrap();
        assert_eq!(out.channel(0), samples.as_slice());
        assert_eq!(plan.severity, Severity::Minimal);
    }

    #[test]
    fn heavy_rewrite_reduces_ratio_toward_target() {
        let sr = 48_000;
        let n = sr as usize * 2;
        let samples = sine_sum(&[(440.0, 0.1), (20_000.0, 0.3)], sr, n);
        let signal = Signal::mono(samples, sr).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(2);
        let options = RewriteOptions { aggressiveness: Aggressiveness::High, ..Default::default() };
        let (out, plan, pre) = rewrite(&signal, options, &mut rng).unwrap();
        let spectrogram = frontend::forward(out.channel(0), sr, 2048, 512).unwrap();
        let after = BandAccountant::compute(&spectrogram);
        assert!(after.ratio <= pre.ratio, "expected ratio to drop, target={}", plan.target_ratio);
    }
}

//! Planner (spec.md §4.6): a cheap pre-analysis (Band Accountant only) that
//! picks a per-file severity class and draws a randomized parameter block
//! from it. Grounded on `remove_audio_fingerprint.py`'s severity-bucket
//! header comment and the teacher's `dsp/notch.rs` pattern of bundling a set
//! of tunable knobs into one struct threaded through every stage.

use crate::bands::BandAccountant;
use crate::frontend::{self, Spectrogram};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::ops::Range;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Heavy,
    Medium,
    Light,
    Minimal,
}

/// Minimal severity has three sub-cases distinguished at plan time; `Skip`
/// short-circuits the Rewriter entirely (spec.md §4.6(b)).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MinimalCase {
    NotApplicable,
    FixOutliers,
    Skip,
    Default,
}

/// Immutable per-file parameter block, drawn once and threaded through
/// every Rewriter stage.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Plan {
    pub severity: Severity,
    pub target_ratio: f64,
    pub masking_strength: f64,
    pub phase_mix: f64,
    pub smoothing_min: f64,
    pub smoothing_max: f64,
    pub masking_variation: f64,
    /// True when `target_ratio` is aimed squarely at the clean zone
    /// (0.14-0.16), switching several Rewriter stages into their
    /// selective/clean-zone mode rather than their global-scaling mode.
    pub targets_clean_zone: bool,
    /// When true the Rewriter must skip entirely and copy input to output
    /// (minimal severity sub-case (b): already clean, no suspicious energy).
    pub skip_rewrite: bool,
}

fn draw(rng: &mut impl Rng, lo: f64, hi: f64) -> f64 {
    rng.random_range(lo..=hi)
}

/// Run the pre-analysis (Band Accountant on a fresh n_fft=2048 STFT) and
/// draw a plan. `rng` is caller-supplied so tests can seed it and
/// production can pass an OS-seeded `StdRng`.
pub fn plan(spectrogram: &Spectrogram, accountant: &BandAccountant, rng: &mut impl Rng) -> Plan {
    let ratio = accountant.ratio;
    let spikiness = watermark_spikiness(spectrogram, accountant);

    let (severity, minimal_case) = classify_severity(ratio, accountant);

    let (target_ratio, masking_strength, phase_mix, mut smoothing_range, masking_variation) =
        match severity {
            Severity::Heavy => (
                draw(rng, 0.10, 0.12),
                draw(rng, 0.008, 0.010),
                draw(rng, 0.30, 0.35),
                (0.20, 0.85),
                draw(rng, 0.05, 0.07),
            ),
            Severity::Medium => (
                draw(rng, 0.11, 0.14),
                draw(rng, 0.006, 0.008),
                draw(rng, 0.25, 0.30),
                (0.20, 0.80),
                draw(rng, 0.04, 0.06),
            ),
            Severity::Light => (
                draw(rng, 0.13, 0.16),
                draw(rng, 0.005, 0.007),
                draw(rng, 0.20, 0.28),
                (0.15, 0.75),
                draw(rng, 0.03, 0.05),
            ),
            Severity::Minimal => {
                let target_ratio = match minimal_case {
                    MinimalCase::FixOutliers => 0.15,
                    MinimalCase::Skip => 0.15,
                    MinimalCase::Default | MinimalCase::NotApplicable => draw(rng, 0.14, 0.17),
                };
                (
                    target_ratio,
                    draw(rng, 0.004, 0.006),
                    draw(rng, 0.15, 0.25),
                    (0.10, 0.70),
                    draw(rng, 0.02, 0.04),
                )
            }
        };

    if spikiness > 0.5 {
        smoothing_range.0 += 0.05;
    }

    let targets_clean_zone = (0.14..=0.16).contains(&target_ratio);
    let skip_rewrite = matches!(minimal_case, MinimalCase::Skip);

    Plan {
        severity,
        target_ratio,
        masking_strength,
        phase_mix,
        smoothing_min: smoothing_range.0,
        smoothing_max: smoothing_range.1,
        masking_variation,
        targets_clean_zone,
        skip_rewrite,
    }
}

/// Convenience wrapper that runs the forward STFT and Band Accountant
/// itself before drawing a plan.
pub fn plan_for_signal(samples: &[f32], sample_rate: u32, rng: &mut impl Rng) -> crate::error::Result<Plan> {
    let spectrogram = frontend::forward(samples, sample_rate, 2048, 512)?;
    let accountant = BandAccountant::compute(&spectrogram);
    Ok(plan(&spectrogram, &accountant, rng))
}

fn classify_severity(ratio: f64, accountant: &BandAccountant) -> (Severity, MinimalCase) {
    if ratio > 0.5 {
        return (Severity::Heavy, MinimalCase::NotApplicable);
    }
    if ratio > 0.25 {
        return (Severity::Medium, MinimalCase::NotApplicable);
    }
    if ratio > 0.15 {
        return (Severity::Light, MinimalCase::NotApplicable);
    }

    if ratio < 0.12 {
        let suspicious_energy = accountant.frame_ratio_stats.std > 0.5
            || accountant.frame_ratio_stats.max > 10.0
            || accountant.frame_ratio_stats.mean > 0.3;
        if suspicious_energy {
            (Severity::Minimal, MinimalCase::FixOutliers)
        } else {
            (Severity::Minimal, MinimalCase::Skip)
        }
    } else {
        (Severity::Minimal, MinimalCase::Default)
    }
}

/// `variance / mean` of the watermark band's magnitude across bins and
/// frames — computed once on the initial STFT (spec.md §4.6).
pub(crate) fn watermark_spikiness(spectrogram: &Spectrogram, accountant: &BandAccountant) -> f64 {
    let Some(range) = accountant.watermark_range.clone() else {
        return 0.0;
    };
    let values: Vec<f64> = spectrogram
        .frames
        .iter()
        .flat_map(|f| f.magnitude[range.clone()].iter().map(|&m| m as f64))
        .collect();
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    if mean < 1e-12 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance / mean
}

#[allow(dead_code)]
fn smoothing_range(plan: &Plan) -> Range<f64> {
    plan.smoothing_min..plan.smoothing_max
}

/// A caller-supplied partial plan (spec.md §6's `plan_override`). Any field
/// left `None` is filled from a freshly drawn plan rather than rejecting
/// the whole override; [`merge_override`] reports which fields were missing
/// so the caller can log a `PlanOverrideRejected` warning.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlanOverride {
    pub severity: Option<Severity>,
    pub target_ratio: Option<f64>,
    pub masking_strength: Option<f64>,
    pub phase_mix: Option<f64>,
    pub smoothing_min: Option<f64>,
    pub smoothing_max: Option<f64>,
    pub masking_variation: Option<f64>,
    pub targets_clean_zone: Option<bool>,
    pub skip_rewrite: Option<bool>,
}

/// Fill `override_`'s missing fields from `fresh`, returning the merged
/// plan plus the names of any fields that were missing.
pub fn merge_override(fresh: Plan, override_: PlanOverride) -> (Plan, Vec<&'static str>) {
    let mut missing = Vec::new();
    macro_rules! field {
        ($name:ident) => {{
            match override_.$name {
                Some(v) => v,
                None => {
                    missing.push(stringify!($name));
                    fresh.$name
                }
            }
        }};
    }
    let merged = Plan {
        severity: field!(severity),
        target_ratio: field!(target_ratio),
        masking_strength: field!(masking_strength),
        phase_mix: field!(phase_mix),
        smoothing_min: field!(smoothing_min),
        smoothing_max: field!(smoothing_max),
        masking_variation: field!(masking_variation),
        targets_clean_zone: field!(targets_clean_zone),
        skip_rewrite: field!(skip_rewrite),
    };
    (merged, missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn sine_with_tone(base: f64, watermark_amp: f32, sample_rate: u32, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| {
                let t = i as f64 / sample_rate as f64;
                let fundamental = (2.0 * std::f64::consts::PI * base * t).sin() as f32;
                let watermark = watermark_amp * (2.0 * std::f64::consts::PI * 20_000.0 * t).sin() as f32;
                fundamental + watermark
            })
            .collect()
    }

    #[test]
    fn heavy_watermark_draws_heavy_severity() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let samples = sine_with_tone(440.0, 0.9, 48_000, 48_000 * 2);
        let p = plan_for_signal(&samples, 48_000, &mut rng).unwrap();
        assert_eq!(p.severity, Severity::Heavy);
        assert!((0.10..=0.12).contains(&p.target_ratio));
    }

    #[test]
    fn clean_signal_skips_rewrite() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let samples = sine_with_tone(440.0, 0.0, 48_000, 48_000 * 2);
        let p = plan_for_signal(&samples, 48_000, &mut rng).unwrap();
        assert_eq!(p.severity, Severity::Minimal);
        assert!(p.skip_rewrite);
    }

    #[test]
    fn seeded_rng_is_deterministic() {
        let samples = sine_with_tone(440.0, 0.5, 48_000, 48_000 * 2);
        let mut rng1 = rand::rngs::StdRng::seed_from_u64(42);
        let mut rng2 = rand::rngs::StdRng::seed_from_u64(42);
        let p1 = plan_for_signal(&samples, 48_000, &mut rng1).unwrap();
        let p2 = plan_for_signal(&samples, 48_000, &mut rng2).unwrap();
        assert_eq!(p1.target_ratio, p2.target_ratio);
        assert_eq!(p1.masking_strength, p2.masking_strength);
    }
}

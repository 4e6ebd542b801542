//! Classifier (spec.md §4.5): a pure decision table from the Band
//! Accountant's metrics plus auxiliary suspicion scores to a status label.
//! Grounded on `original_source/.../analyze_fingerprint.py`'s threshold
//! cascade, translated from its `if/elif` chain into a Rust match over
//! explicit guard conditions in the same order.

use crate::CLEAN_ZONE;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The four status labels a metrics record can resolve to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Clean,
    Suspicious,
    Watermarked,
    PossiblyCleaned,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Clean => "clean",
            Status::Suspicious => "suspicious",
            Status::Watermarked => "watermarked",
            Status::PossiblyCleaned => "possibly_cleaned",
        };
        f.write_str(s)
    }
}

/// The subset of the Metrics report the Classifier actually consumes.
///
/// `frames_elevated` is the percentage of frames above the 0.25 crossing
/// threshold; `frames_higher` is the percentage above 0.18 — two different
/// thresholds from `bands::CROSSING_THRESHOLDS`, intentionally distinct
/// (the 18%-vs-15% naming in the distilled threshold table resolves to 18%
/// here; see the test below and DESIGN.md).
#[derive(Clone, Copy, Debug, Default)]
pub struct ClassifierInputs {
    pub ratio: f64,
    pub max_frame_ratio: f64,
    pub mean_frame_ratio: f64,
    pub frames_elevated_pct: f64,
    pub frames_higher_pct: f64,
    pub combined_suspicion: f64,
}

/// The frame-ratio-percentage threshold the clean-zone `frames_higher` rows
/// of the decision table check (spec.md §4.5, §9: the clean-zone branches
/// use 18%). The ρ∉C "watermarked" row uses a separate, lower threshold —
/// see [`FRAMES_HIGHER_OUTSIDE_CLEAN_ZONE_THRESHOLD_PCT`].
pub const FRAMES_HIGHER_CLEAN_ZONE_THRESHOLD_PCT: f64 = 18.0;

/// The frame-ratio-percentage threshold for the ρ∉C "watermarked" row
/// (spec.md §4.5 table row 3: "frames_higher > 15% and ρ ∉ C"). Ground-truth
/// `analyze_fingerprint.py` checks `frames_watermark_higher > 15` here; the
/// §9 open question's 18% resolution applies only to the clean-zone
/// branches, not this one.
pub const FRAMES_HIGHER_OUTSIDE_CLEAN_ZONE_THRESHOLD_PCT: f64 = 15.0;

/// Evaluate the decision table. First matching row wins, exactly mirroring
/// the legacy cascade's `if/elif` ordering.
pub fn classify(m: &ClassifierInputs) -> Status {
    let in_clean_zone = m.ratio >= CLEAN_ZONE.0 && m.ratio <= CLEAN_ZONE.1;

    if m.ratio > 0.35 {
        return Status::Watermarked;
    }
    if m.ratio > 0.25 || (m.frames_elevated_pct > 10.0 && !in_clean_zone) {
        return Status::Suspicious;
    }
    if m.frames_higher_pct > FRAMES_HIGHER_OUTSIDE_CLEAN_ZONE_THRESHOLD_PCT && !in_clean_zone {
        return Status::Watermarked;
    }
    if m.frames_higher_pct > FRAMES_HIGHER_CLEAN_ZONE_THRESHOLD_PCT && in_clean_zone {
        return Status::Suspicious;
    }
    if in_clean_zone
        && (m.max_frame_ratio > 10.0
            || m.mean_frame_ratio > 0.5
            || m.frames_higher_pct > FRAMES_HIGHER_CLEAN_ZONE_THRESHOLD_PCT)
    {
        return Status::Suspicious;
    }
    if in_clean_zone {
        return Status::Clean;
    }
    if m.combined_suspicion > 0.6 && m.ratio < 0.12 {
        return Status::PossiblyCleaned;
    }
    if m.ratio < 0.12 {
        return Status::PossiblyCleaned;
    }
    Status::Clean
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ClassifierInputs {
        ClassifierInputs { ratio: 0.15, ..Default::default() }
    }

    #[test]
    fn high_ratio_is_watermarked() {
        let m = ClassifierInputs { ratio: 0.40, ..base() };
        assert_eq!(classify(&m), Status::Watermarked);
    }

    #[test]
    fn moderately_elevated_ratio_is_suspicious() {
        let m = ClassifierInputs { ratio: 0.30, ..base() };
        assert_eq!(classify(&m), Status::Suspicious);
    }

    #[test]
    fn clean_zone_ratio_with_no_red_flags_is_clean() {
        let m = ClassifierInputs { ratio: 0.15, ..base() };
        assert_eq!(classify(&m), Status::Clean);
    }

    #[test]
    fn clean_zone_ratio_with_spiky_max_frame_is_suspicious() {
        let m = ClassifierInputs { ratio: 0.15, max_frame_ratio: 12.0, ..base() };
        assert_eq!(classify(&m), Status::Suspicious);
    }

    #[test]
    fn low_ratio_is_possibly_cleaned() {
        let m = ClassifierInputs { ratio: 0.05, ..base() };
        assert_eq!(classify(&m), Status::PossiblyCleaned);
    }

    #[test]
    fn low_ratio_with_high_suspicion_is_possibly_cleaned() {
        let m = ClassifierInputs { ratio: 0.05, combined_suspicion: 0.8, ..base() };
        assert_eq!(classify(&m), Status::PossiblyCleaned);
    }

    #[test]
    fn every_status_is_reachable_from_a_swept_ratio() {
        let mut seen = std::collections::HashSet::new();
        let mut ratio = 0.0;
        while ratio <= 0.6 {
            let m = ClassifierInputs { ratio, ..Default::default() };
            seen.insert(classify(&m));
            ratio += 0.01;
        }
        assert!(seen.contains(&Status::Clean));
        assert!(seen.contains(&Status::Watermarked));
        assert!(seen.contains(&Status::PossiblyCleaned));
    }

    /// The ρ∉C "watermarked" row (table row 3) fires at 15%, matching
    /// ground-truth `analyze_fingerprint.py`'s `frames_watermark_higher > 15`;
    /// only the clean-zone rows use 18%.
    #[test]
    fn frames_higher_threshold_is_fifteen_percent_outside_clean_zone() {
        assert_eq!(FRAMES_HIGHER_OUTSIDE_CLEAN_ZONE_THRESHOLD_PCT, 15.0);
        assert_eq!(FRAMES_HIGHER_CLEAN_ZONE_THRESHOLD_PCT, 18.0);

        // At or below 15%, outside the clean zone: table row 3 must not fire.
        let m = ClassifierInputs { ratio: 0.20, frames_higher_pct: 15.0, ..Default::default() };
        assert_ne!(classify(&m), Status::Watermarked);

        // Above 15%, outside the clean zone: now it fires, even though this
        // is still at or below the clean-zone rows' 18% threshold.
        let m = ClassifierInputs { ratio: 0.20, frames_higher_pct: 16.0, ..Default::default() };
        assert_eq!(classify(&m), Status::Watermarked);
    }
}

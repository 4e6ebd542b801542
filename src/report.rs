//! Metrics report (spec.md §3, §6): the flat record `analyze` returns,
//! JSON-serializable with per-field rounding by semantic type (percentages
//! to 2 decimal places, ratios and suspicions to 4, raw energies to 6).
//! Grounded on the teacher's `dsp/notch.rs::NoiseProfile`, which serializes
//! a flat bag of tuned floats the same way.

use crate::classifier::Status;
use serde::{Deserialize, Serialize};

fn round_to(value: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    (value * factor).round() / factor
}

fn round2<S: serde::Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(round_to(*v, 2))
}

fn round4<S: serde::Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(round_to(*v, 4))
}

fn round6<S: serde::Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(round_to(*v, 6))
}

/// Threshold-crossing percentage for one `bands::CROSSING_THRESHOLDS` entry.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ThresholdCrossing {
    pub threshold: f64,
    #[serde(serialize_with = "round2")]
    pub percentage: f64,
}

/// The full Metrics report (spec.md §4.4's field list, in declaration
/// order — the JSON emission keeps keys in this order per spec.md §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Report {
    // Energy / ratio metrics.
    #[serde(serialize_with = "round4")]
    pub ratio: f64,
    #[serde(serialize_with = "round4")]
    pub mean_frame_ratio: f64,
    #[serde(serialize_with = "round4")]
    pub median_frame_ratio: f64,
    #[serde(serialize_with = "round4")]
    pub max_frame_ratio: f64,
    pub threshold_crossings: Vec<ThresholdCrossing>,

    // Phase coherence.
    #[serde(serialize_with = "round4")]
    pub phase_coherence_watermark: f64,
    #[serde(serialize_with = "round4")]
    pub phase_coherence_reference: f64,
    #[serde(serialize_with = "round4")]
    pub coherence_ratio: f64,

    // Suspicion scores, all in [0, 1].
    #[serde(serialize_with = "round4")]
    pub normalization_suspicion: f64,
    #[serde(serialize_with = "round4")]
    pub dithering_suspicion: f64,
    #[serde(serialize_with = "round4")]
    pub filter_artifact_suspicion: f64,
    #[serde(serialize_with = "round4")]
    pub mfcc_suspicion: f64,
    #[serde(serialize_with = "round4")]
    pub chroma_suspicion: f64,
    #[serde(serialize_with = "round4")]
    pub contrast_suspicion: f64,
    #[serde(serialize_with = "round4")]
    pub pitch_suspicion: f64,
    #[serde(serialize_with = "round4")]
    pub tempo_suspicion: f64,
    #[serde(serialize_with = "round4")]
    pub centroid_suspicion: f64,
    #[serde(serialize_with = "round4")]
    pub bandwidth_suspicion: f64,
    #[serde(serialize_with = "round4")]
    pub combined_suspicion: f64,

    // Signal-level context.
    pub sample_rate: u32,
    #[serde(serialize_with = "round6")]
    pub duration_secs: f64,
    #[serde(serialize_with = "round6")]
    pub nyquist_hz: f64,

    pub status: Status,

    /// Downsampled magnitude grid (`image_hint_columns[t][band]`) a caller
    /// can hand to an external spectrogram renderer. `None` unless
    /// `AnalyzeOptions::emit_image_hints` was set — actual image rendering
    /// stays out of this crate (spec.md §1 non-goals).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_hint_columns: Option<Vec<Vec<f32>>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_fields_by_semantic_type_on_serialize() {
        let report = Report {
            ratio: 0.123456789,
            mean_frame_ratio: 0.1,
            median_frame_ratio: 0.1,
            max_frame_ratio: 1.0,
            threshold_crossings: vec![ThresholdCrossing { threshold: 0.10, percentage: 12.3456 }],
            phase_coherence_watermark: 0.5,
            phase_coherence_reference: 0.5,
            coherence_ratio: 1.0,
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
            sample_rate: 48_000,
            duration_secs: 3.0000001,
            nyquist_hz: 24_000.0,
            status: Status::Clean,
            image_hint_columns: None,
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"ratio\":0.1235"));
        assert!(json.contains("\"percentage\":12.35"));
        assert!(json.contains("\"status\":\"clean\""));
    }
}

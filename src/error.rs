use thiserror::Error;

/// Errors the core can produce. Most conditions described in spec.md §7 are
/// non-fatal and are logged rather than surfaced here; these variants cover
/// only the cases that must stop the pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// Signal is empty, contains non-finite samples, or is shorter than the
    /// frontend's `n_fft`. Fatal; no output is produced.
    #[error("invalid signal: {0}")]
    InvalidSignal(String),

    /// Stereo signal whose channels disagree in length or sample rate.
    #[error("channel mismatch: {0}")]
    ChannelMismatch(String),

    /// A plan override was missing required keys; the caller should treat
    /// this as a warning, not a hard failure (spec.md §7's
    /// `PlanOverrideRejected`). Kept as a typed error so it can be logged
    /// through the same `Display` formatting as the fatal variants.
    #[error("plan override rejected: missing key {0}")]
    PlanOverrideRejected(String),

    /// A feature routine (pitch, tempo, MFCC, ...) could not run on this
    /// signal. Non-fatal: the Analyzer sets the corresponding suspicion to 0
    /// and the Rewriter skips the affected feature-preservation branch.
    #[error("feature extraction failed: {0}")]
    FeatureExtractionFailure(String),

    /// Nyquist below 18 kHz leaves the watermark band empty. Non-fatal: the
    /// Analyzer still emits a report with zero-valued watermark metrics and
    /// `clean` status; the Rewriter copies input to output unchanged.
    #[error("unsupported sample rate: {0}")]
    UnsupportedSampleRate(String),

    /// Reference energy collapsed below 10⁻¹⁰, or a stage produced non-finite
    /// magnitudes. Non-fatal: the Rewriter clamps ratios to [0, 2.0] and
    /// relies on the Reference Preservation hook to prevent further damage.
    #[error("numerical degeneracy: {0}")]
    NumericalDegeneracy(String),
}

pub type Result<T> = std::result::Result<T, Error>;

//! End-to-end scenarios against the public `analyze`/`rewrite` API, covering
//! the sample-rate downgrade path, both watermark-band extremes, stereo
//! per-channel independence, and the rewrite invariants (amplitude ceiling,
//! below-15 kHz preservation, ratio reduction for a heavy case).

use rand::SeedableRng;
use spectral_forensics::{
    analyze, rewrite, Aggressiveness, AnalyzeOptions, PEAK_CEILING, RewriteOptions, Signal, Status,
};
use spectral_forensics::bands::BandAccountant;
use spectral_forensics::frontend;

fn sine(freq: f64, sample_rate: u32, n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 / sample_rate as f64).sin() as f32)
        .collect()
}

fn mix(signals: &[Vec<f32>]) -> Vec<f32> {
    let n = signals[0].len();
    (0..n)
        .map(|i| signals.iter().map(|s| s[i]).sum::<f32>() / signals.len() as f32)
        .collect()
}

#[test]
fn unsupported_sample_rate_reports_clean_with_zero_ratio() {
    // Nyquist 16 kHz leaves the 18-22 kHz watermark band empty entirely.
    let sr = 32_000;
    let samples = sine(440.0, sr, sr as usize * 2);
    let signal = Signal::mono(samples, sr).unwrap();

    let report = analyze(&signal, AnalyzeOptions::default()).unwrap();

    assert_eq!(report.status, Status::Clean);
    assert_eq!(report.ratio, 0.0);
    assert!(report.threshold_crossings.iter().all(|c| c.percentage == 0.0));
}

#[test]
fn pure_tone_in_watermark_band_is_flagged_watermarked() {
    let sr = 48_000;
    let samples = sine(20_000.0, sr, sr as usize * 2);
    let signal = Signal::mono(samples, sr).unwrap();

    let report = analyze(&signal, AnalyzeOptions::default()).unwrap();

    assert_eq!(report.status, Status::Watermarked);
    assert!(report.ratio > 0.35, "ratio={}", report.ratio);
}

#[test]
fn tone_confined_below_watermark_band_is_flagged_possibly_cleaned() {
    // Energy at 1 kHz and 15 kHz gives the reference band (14-18 kHz)
    // something to measure, while the watermark band (18-22 kHz) stays
    // silent - ratio collapses toward zero, well under the clean zone's
    // 0.11 floor.
    let sr = 44_100;
    let samples = mix(&[sine(1_000.0, sr, sr as usize * 2), sine(15_000.0, sr, sr as usize * 2)]);
    let signal = Signal::mono(samples, sr).unwrap();

    let report = analyze(&signal, AnalyzeOptions::default()).unwrap();

    assert_eq!(report.status, Status::PossiblyCleaned);
    assert!(report.ratio < 0.12, "ratio={}", report.ratio);
}

#[test]
fn stereo_channels_analyze_independently() {
    let sr = 48_000;
    let n = sr as usize * 2;
    let clean_channel = sine(1_000.0, sr, n);
    let watermarked_channel = sine(20_000.0, sr, n);

    // The combined stereo signal just needs to be well-formed; `analyze`
    // only ever looks at one channel at a time (spec.md §4.8), so callers
    // analyze each channel's own mono `Signal`.
    let stereo = Signal::new(vec![clean_channel.clone(), watermarked_channel.clone()], sr).unwrap();
    assert!(stereo.is_stereo());

    let left_report = analyze(&Signal::mono(clean_channel, sr).unwrap(), AnalyzeOptions::default()).unwrap();
    let right_report = analyze(&Signal::mono(watermarked_channel, sr).unwrap(), AnalyzeOptions::default()).unwrap();

    assert_ne!(left_report.status, Status::Watermarked);
    assert_eq!(right_report.status, Status::Watermarked);
}

#[test]
fn rewrite_keeps_output_within_the_amplitude_ceiling() {
    let sr = 48_000;
    let n = sr as usize * 2;
    let loud_watermarked = sine(20_000.0, sr, n);
    let signal = Signal::mono(loud_watermarked, sr).unwrap();

    let options = RewriteOptions {
        aggressiveness: Aggressiveness::High,
        humanizing_factor: 1.0,
        enable_humanization: true,
        plan_override: None,
    };
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let (rewritten, _plan, _pre) = rewrite(&signal, options, &mut rng).unwrap();

    for &s in rewritten.channel(0) {
        assert!(s.abs() <= PEAK_CEILING, "sample {s} exceeds the amplitude ceiling");
    }
}

#[test]
fn rewrite_preserves_energy_below_15_khz() {
    let sr = 48_000;
    let n = sr as usize * 2;
    let signal = Signal::mono(
        mix(&[sine(1_000.0, sr, n), sine(20_000.0, sr, n)]),
        sr,
    )
    .unwrap();

    let options = RewriteOptions { aggressiveness: Aggressiveness::Medium, ..Default::default() };
    let mut rng = rand::rngs::StdRng::seed_from_u64(11);
    let (rewritten, _plan, _pre) = rewrite(&signal, options, &mut rng).unwrap();

    let before_spec = frontend::forward(signal.channel(0), sr, 2048, 512).unwrap();
    let after_spec = frontend::forward(rewritten.channel(0), sr, 2048, 512).unwrap();
    let low_band = before_spec.bin_range(500.0, 1_500.0).unwrap();

    let before_energy = spectral_forensics::bands::band_mean(&before_spec, &low_band);
    let after_energy = spectral_forensics::bands::band_mean(&after_spec, &low_band);

    assert!(before_energy > 0.0);
    let relative_drop = (before_energy - after_energy).abs() / before_energy;
    assert!(relative_drop < 0.25, "relative_drop={relative_drop} before={before_energy} after={after_energy}");
}

#[test]
fn rewrite_reduces_ratio_for_a_heavily_watermarked_signal() {
    let sr = 48_000;
    let n = sr as usize * 2;
    let signal = Signal::mono(sine(20_000.0, sr, n), sr).unwrap();

    let original_spec = frontend::forward(signal.channel(0), sr, 2048, 512).unwrap();
    let original_ratio = BandAccountant::compute(&original_spec).ratio;

    let options = RewriteOptions { aggressiveness: Aggressiveness::High, ..Default::default() };
    let mut rng = rand::rngs::StdRng::seed_from_u64(3);
    let (rewritten, plan, _pre) = rewrite(&signal, options, &mut rng).unwrap();
    assert!(!plan.skip_rewrite);

    let rewritten_spec = frontend::forward(rewritten.channel(0), sr, 2048, 512).unwrap();
    let rewritten_ratio = BandAccountant::compute(&rewritten_spec).ratio;

    assert!(
        rewritten_ratio < original_ratio * 0.9,
        "original_ratio={original_ratio} rewritten_ratio={rewritten_ratio}"
    );
}

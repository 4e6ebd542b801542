//! Opt-in humanization (spec.md §4.7 "Post-pipeline — Humanization"):
//! analog-style saturation, room tone, a subtle parametric EQ, and (for
//! stereo signals) mid/side imaging. Grounded on `dsp/filters.rs`'s
//! single-pole low-pass (for the room-tone low-pass) and `dsp/notch.rs`'s
//! biquad pattern, generalized via [`super::biquad::Biquad`].

use super::biquad::Biquad;
use rand::Rng;

/// RMS-preserving tanh saturation at the given drive.
pub fn tanh_saturate(samples: &[f32], drive: f64) -> Vec<f32> {
    if samples.is_empty() {
        return Vec::new();
    }
    let rms_in = rms(samples);
    let driven: Vec<f32> = samples.iter().map(|&x| (drive * x as f64).tanh() as f32 / drive as f32).collect();
    let rms_out = rms(&driven);
    if rms_out < 1e-9 {
        return driven;
    }
    let gain = rms_in / rms_out;
    driven.iter().map(|&x| x * gain as f32).collect()
}

fn rms(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|&x| (x as f64).powi(2)).sum::<f64>() / samples.len() as f64).sqrt()
}

/// Pink noise via Paul Kellet's refined one-pole cascade approximation.
fn pink_noise(rng: &mut impl Rng, n: usize) -> Vec<f32> {
    let (mut b0, mut b1, mut b2, mut b3, mut b4, mut b5, mut b6) = (0f32, 0f32, 0f32, 0f32, 0f32, 0f32, 0f32);
    (0..n)
        .map(|_| {
            let white: f32 = rng.random_range(-1.0..1.0);
            b0 = 0.99886 * b0 + white * 0.0555179;
            b1 = 0.99332 * b1 + white * 0.0750759;
            b2 = 0.96900 * b2 + white * 0.1538520;
            b3 = 0.86650 * b3 + white * 0.3104856;
            b4 = 0.55000 * b4 + white * 0.5329522;
            b5 = -0.7616 * b5 - white * 0.0168980;
            let pink = b0 + b1 + b2 + b3 + b4 + b5 + b6 + white * 0.5362;
            b6 = white * 0.115926;
            pink * 0.11
        })
        .collect()
}

/// Pink-noise room tone at -65 dBFS, low-passed at 4 kHz, summed into the
/// signal.
pub fn add_room_tone(samples: &[f32], sample_rate: u32, rng: &mut impl Rng) -> Vec<f32> {
    let noise = pink_noise(rng, samples.len());
    let mut lpf = Biquad::lowpass(4_000.0, 0.707, sample_rate);
    let filtered = lpf.process_buffer(&noise);
    let target_amplitude = 10f32.powf(-65.0 / 20.0);
    let noise_rms = rms(&filtered) as f32;
    let scale = if noise_rms > 1e-9 { target_amplitude / noise_rms } else { 0.0 };
    samples.iter().zip(filtered.iter()).map(|(&s, &n)| s + n * scale).collect()
}

/// 60 Hz high-pass, +1.5 dB peak at 2.5 kHz (Q 0.5), -0.2 dB peak at 9 kHz
/// (Q 0.3).
pub fn parametric_eq(samples: &[f32], sample_rate: u32) -> Vec<f32> {
    let mut hpf = Biquad::highpass(60.0, 0.707, sample_rate);
    let mut presence = Biquad::peaking(2_500.0, 0.5, 1.5, sample_rate);
    let mut air = Biquad::peaking(9_000.0, 0.3, -0.2, sample_rate);

    let stage1 = hpf.process_buffer(samples);
    let stage2 = presence.process_buffer(&stage1);
    air.process_buffer(&stage2)
}

/// Mid/side imaging that narrows the 1-2 kHz side content by 10% and widens
/// the 8-12 kHz side content by 5%, approximated with peaking filters on
/// the side channel centered at the midpoint of each band.
pub fn stereo_image(left: &[f32], right: &[f32], sample_rate: u32) -> (Vec<f32>, Vec<f32>) {
    let n = left.len().min(right.len());
    let mid: Vec<f32> = (0..n).map(|i| 0.5 * (left[i] + right[i])).collect();
    let mut side: Vec<f32> = (0..n).map(|i| 0.5 * (left[i] - right[i])).collect();

    let narrow_db = 20.0 * 0.90f64.log10();
    let widen_db = 20.0 * 1.05f64.log10();
    let mut narrow = Biquad::peaking(1_500.0, 1.0, narrow_db, sample_rate);
    let mut widen = Biquad::peaking(10_000.0, 1.0, widen_db, sample_rate);
    side = narrow.process_buffer(&side);
    side = widen.process_buffer(&side);

    let left_out: Vec<f32> = (0..n).map(|i| mid[i] + side[i]).collect();
    let right_out: Vec<f32> = (0..n).map(|i| mid[i] - side[i]).collect();
    (left_out, right_out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn saturation_preserves_rms() {
        let samples: Vec<f32> = (0..4800)
            .map(|i| 0.5 * (2.0 * std::f64::consts::PI * 440.0 * i as f64 / 48_000.0).sin() as f32)
            .collect();
        let out = tanh_saturate(&samples, 0.12);
        assert!((rms(&out) - rms(&samples)).abs() / rms(&samples) < 0.05);
    }

    #[test]
    fn room_tone_is_subtle() {
        let samples = vec![0.3f32; 48_000];
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let out = add_room_tone(&samples, 48_000, &mut rng);
        let diff_rms = rms(&out.iter().zip(samples.iter()).map(|(a, b)| a - b).collect::<Vec<_>>());
        assert!(diff_rms < 0.01, "room tone too loud: {diff_rms}");
    }

    #[test]
    fn stereo_image_does_not_introduce_nan_or_clipping() {
        let n = 4800;
        let left: Vec<f32> = (0..n)
            .map(|i| 0.4 * (2.0 * std::f64::consts::PI * 5_000.0 * i as f64 / 48_000.0).sin() as f32)
            .collect();
        let right: Vec<f32> = (0..n)
            .map(|i| 0.4 * (2.0 * std::f64::consts::PI * 5_050.0 * i as f64 / 48_000.0).sin() as f32)
            .collect();
        let (l_out, r_out) = stereo_image(&left, &right, 48_000);
        assert!(l_out.iter().all(|x| x.is_finite() && x.abs() < 1.0));
        assert!(r_out.iter().all(|x| x.is_finite() && x.abs() < 1.0));
    }
}

//! Container encode (spec.md §1's "external collaborators", §6's MP3 note).
//! WAV is written directly via `hound`, the teacher's own dependency choice.
//! MP3 is written only via an external encoder subprocess at the requested
//! bitrate (spec.md §6) — the core never links an MP3 encoder itself.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::process::Command;

pub fn write(path: &Path, samples: &[f32], sample_rate: u32, mp3_bitrate: u32) -> Result<()> {
    match path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()) {
        Some(ext) if ext == "mp3" => write_mp3_via_external_encoder(path, samples, sample_rate, mp3_bitrate),
        _ => write_wav(path, samples, sample_rate),
    }
}

fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec).context("creating WAV writer")?;
    for &s in samples {
        writer.write_sample(s).context("writing WAV sample")?;
    }
    writer.finalize().context("finalizing WAV file")
}

/// Writes a temporary WAV, then shells out to `lame` to produce the final
/// MP3 at `mp3_bitrate` kbps (spec.md §6: "MP3 only via an external encoder,
/// bitrate 320k default"). Verification (spec.md's Rewriter "Verification"
/// step) has already run on the pre-encode signal by the time this is
/// called; re-encoding here cannot re-introduce watermark energy that the
/// verification observed (spec.md §9's MP3 round-trip open question).
fn write_mp3_via_external_encoder(path: &Path, samples: &[f32], sample_rate: u32, mp3_bitrate: u32) -> Result<()> {
    let tmp_wav = path.with_extension("pre-encode.wav");
    write_wav(&tmp_wav, samples, sample_rate)?;

    let status = Command::new("lame")
        .arg("--quiet")
        .arg("-b")
        .arg(mp3_bitrate.to_string())
        .arg(&tmp_wav)
        .arg(path)
        .status()
        .context("spawning external MP3 encoder (`lame`); is it installed and on PATH?")?;

    let _ = std::fs::remove_file(&tmp_wav);

    if !status.success() {
        return Err(anyhow!("external MP3 encoder exited with {status}"));
    }
    Ok(())
}

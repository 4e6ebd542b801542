//! Container decode to floating-point mono (spec.md §1's "external
//! collaborators"). Grounded on the teacher's `src/audio/loader.rs` (WAV/FLAC
//! dispatch by magic bytes, int-to-float normalization) and
//! `src-tauri/src/audio_decode.rs` (lewton OGG decode, interleaved-to-mono
//! mixdown).

use anyhow::{anyhow, Context, Result};
use std::io::Cursor;
use std::path::Path;

pub struct Decoded {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

pub fn load(path: &Path) -> Result<Decoded> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if bytes.len() < 4 {
        return Err(anyhow!("file too small to be a recognized audio container"));
    }
    match &bytes[0..4] {
        b"RIFF" => decode_wav(&bytes),
        b"fLaC" => decode_flac(&bytes),
        b"OggS" => decode_ogg(&bytes),
        magic => Err(anyhow!("unsupported container (magic bytes {magic:?}); expected WAV, FLAC, or OGG")),
    }
}

fn decode_wav(bytes: &[u8]) -> Result<Decoded> {
    let cursor = Cursor::new(bytes);
    let reader = hound::WavReader::new(cursor).context("WAV decode")?;
    let spec = reader.spec();
    let sample_rate = spec.sample_rate;
    let channels = spec.channels as u32;

    let all_samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => {
            reader.into_samples::<f32>().collect::<Result<Vec<_>, _>>().context("WAV float samples")?
        }
        hound::SampleFormat::Int => {
            let max_val = (1u32 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .collect::<Result<Vec<_>, _>>()
                .context("WAV int samples")?
                .into_iter()
                .map(|s| s as f32 / max_val)
                .collect()
        }
    };

    Ok(Decoded { samples: mix_to_mono(&all_samples, channels), sample_rate })
}

fn decode_flac(bytes: &[u8]) -> Result<Decoded> {
    let cursor = Cursor::new(bytes);
    let mut reader = claxon::FlacReader::new(cursor).context("FLAC decode")?;
    let info = reader.streaminfo();
    let sample_rate = info.sample_rate;
    let channels = info.channels;
    let max_val = (1u32 << (info.bits_per_sample - 1)) as f32;

    let all_samples: Vec<f32> = reader
        .samples()
        .map(|s| s.map(|v| v as f32 / max_val))
        .collect::<Result<Vec<_>, _>>()
        .context("FLAC samples")?;

    Ok(Decoded { samples: mix_to_mono(&all_samples, channels), sample_rate })
}

fn decode_ogg(bytes: &[u8]) -> Result<Decoded> {
    use lewton::inside_ogg::OggStreamReader;

    let cursor = Cursor::new(bytes.to_vec());
    let mut reader = OggStreamReader::new(cursor).context("OGG decode")?;
    let sample_rate = reader.ident_hdr.audio_sample_rate;
    let channels = reader.ident_hdr.audio_channels as u32;

    let mut all_samples: Vec<f32> = Vec::new();
    loop {
        match reader.read_dec_packet_itl() {
            Ok(Some(packet)) => all_samples.extend(packet.iter().map(|&s| s as f32 / 32768.0)),
            Ok(None) => break,
            Err(e) => return Err(anyhow!("OGG decode error: {e}")),
        }
    }

    Ok(Decoded { samples: mix_to_mono(&all_samples, channels), sample_rate })
}

fn mix_to_mono(samples: &[f32], channels: u32) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let ch = channels as usize;
    samples.chunks_exact(ch).map(|frame| frame.iter().sum::<f32>() / channels as f32).collect()
}

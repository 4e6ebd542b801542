//! Reference executable for the spectral watermark analysis/rewrite core
//! (spec.md §6, §1's "external collaborators"). Decodes WAV/FLAC/OGG to a
//! floating-point mono signal, calls into `spectral_forensics::{analyze,
//! rewrite}`, writes the result back out, and prints the JSON metrics line.
//!
//! Grounded on the teacher's `xc-cli/src/main.rs` (clap derive, subcommand
//! shape, exit-code-on-error pattern) and `src-tauri/src/audio_decode.rs`
//! (hound/claxon/lewton decode-to-f32-mono, format dispatch by magic bytes).

mod decode;
mod encode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::SeedableRng;
use spectral_forensics::{analyze, rewrite, Aggressiveness, AnalyzeOptions, RewriteOptions, Signal};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "spectral-cli", about = "Analyze or rewrite a recording's 12-22 kHz watermark traces")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the Analyzer and print a metrics report as one JSON line.
    Analyze {
        input: PathBuf,

        /// STFT size for the analysis path: 1024 (low-resolution) or 2048 (default).
        #[arg(long, default_value_t = 2048)]
        n_fft: usize,

        /// Skip the Feature Extractor (MFCC/chroma/contrast/pitch/tempo/centroid/bandwidth).
        #[arg(long)]
        no_features: bool,

        /// Emit a downsampled magnitude grid an external renderer can use for a preview image.
        #[arg(long)]
        emit_image_hints: bool,
    },
    /// Run the Rewriter and write the result to `output`, plus a JSON metrics line for `output`.
    Rewrite {
        input: PathBuf,
        output: PathBuf,

        #[arg(long, value_enum, default_value = "medium")]
        aggressiveness: AggressivenessArg,

        /// h in [0, 1]; scales the post-pipeline statistical-pattern stages.
        #[arg(long, default_value_t = 0.0)]
        humanizing_factor: f64,

        /// Opt-in analog saturation, room tone, parametric EQ, and stereo imaging.
        #[arg(long)]
        enable_humanization: bool,

        /// Seed the Planner's random source for reproducible output.
        #[arg(long)]
        seed: Option<u64>,

        /// Bitrate for MP3 output via an external encoder, in kbps.
        #[arg(long, default_value_t = 320)]
        mp3_bitrate: u32,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum AggressivenessArg {
    Low,
    Medium,
    High,
}

impl From<AggressivenessArg> for Aggressiveness {
    fn from(a: AggressivenessArg) -> Self {
        match a {
            AggressivenessArg::Low => Aggressiveness::Low,
            AggressivenessArg::Medium => Aggressiveness::Medium,
            AggressivenessArg::High => Aggressiveness::High,
        }
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Analyze { input, n_fft, no_features, emit_image_hints } => {
            let decoded = decode::load(&input).with_context(|| format!("decoding {}", input.display()))?;
            let signal = Signal::mono(decoded.samples, decoded.sample_rate)?;
            let options = AnalyzeOptions { n_fft, include_features: !no_features, emit_image_hints };
            let report = analyze(&signal, options)?;
            println!("{}", serde_json::to_string(&report)?);
            Ok(())
        }
        Commands::Rewrite { input, output, aggressiveness, humanizing_factor, enable_humanization, seed, mp3_bitrate } => {
            let decoded = decode::load(&input).with_context(|| format!("decoding {}", input.display()))?;
            let signal = Signal::mono(decoded.samples, decoded.sample_rate)?;

            let mut rng = match seed {
                Some(s) => rand::rngs::StdRng::seed_from_u64(s),
                None => rand::rngs::StdRng::from_os_rng(),
            };
            let options = RewriteOptions {
                aggressiveness: aggressiveness.into(),
                humanizing_factor,
                enable_humanization,
                plan_override: None,
            };
            let (rewritten, plan, pre_analysis) = rewrite(&signal, options, &mut rng)?;

            encode::write(&output, rewritten.channel(0), rewritten.sample_rate(), mp3_bitrate)
                .with_context(|| format!("writing {}", output.display()))?;

            let verify_options = AnalyzeOptions { n_fft: 2048, include_features: false, emit_image_hints: false };
            let report = analyze(&rewritten, verify_options)?;
            log::info!(
                "rewrite complete: severity={:?} target_ratio={:.4} pre_ratio={:.4}",
                plan.severity,
                plan.target_ratio,
                pre_analysis.ratio
            );
            println!("{}", serde_json::to_string(&report)?);
            Ok(())
        }
    }
}

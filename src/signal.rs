//! The `Signal` data type (spec.md §3): a finite ordered sequence of
//! floating-point samples per channel, tagged with a sample rate.

use crate::error::{Error, Result};

/// A mono or stereo floating-point signal. All channels share length and
/// sample rate — that invariant is checked once, at construction, rather
/// than re-checked by every consumer.
#[derive(Clone, Debug)]
pub struct Signal {
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl Signal {
    /// Build a signal from 1 or 2 channels of equal length.
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Result<Self> {
        if channels.is_empty() || channels.len() > 2 {
            return Err(Error::InvalidSignal(format!(
                "expected 1 or 2 channels, got {}",
                channels.len()
            )));
        }
        let len = channels[0].len();
        if len == 0 {
            return Err(Error::InvalidSignal("signal is empty".into()));
        }
        for ch in &channels {
            if ch.len() != len {
                return Err(Error::ChannelMismatch(format!(
                    "channel lengths differ: {} vs {}",
                    len,
                    ch.len()
                )));
            }
            if ch.iter().any(|s| !s.is_finite()) {
                return Err(Error::InvalidSignal("signal contains non-finite samples".into()));
            }
        }
        if sample_rate == 0 {
            return Err(Error::InvalidSignal("sample rate must be nonzero".into()));
        }
        Ok(Signal { channels, sample_rate })
    }

    /// Convenience constructor for a mono signal.
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Result<Self> {
        Self::new(vec![samples], sample_rate)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn is_stereo(&self) -> bool {
        self.channels.len() == 2
    }

    pub fn len(&self) -> usize {
        self.channels[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn duration_secs(&self) -> f64 {
        self.len() as f64 / self.sample_rate as f64
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    pub fn channels(&self) -> &[Vec<f32>] {
        &self.channels
    }

    /// Nyquist frequency for this signal's sample rate.
    pub fn nyquist(&self) -> f64 {
        self.sample_rate as f64 / 2.0
    }

    /// Rebuild a signal from freshly processed per-channel buffers, keeping
    /// the original sample rate. Used by the Rewriter to hand back its
    /// output without re-validating finiteness (stages guarantee it via
    /// `NumericalDegeneracy` handling).
    pub fn from_processed_channels(channels: Vec<Vec<f32>>, sample_rate: u32) -> Self {
        Signal { channels, sample_rate }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_signal() {
        assert!(Signal::mono(vec![], 48_000).is_err());
    }

    #[test]
    fn rejects_mismatched_channel_lengths() {
        let result = Signal::new(vec![vec![0.0; 100], vec![0.0; 90]], 48_000);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_non_finite_samples() {
        let result = Signal::mono(vec![0.0, f32::NAN, 0.0], 48_000);
        assert!(result.is_err());
    }

    #[test]
    fn accepts_well_formed_stereo() {
        let sig = Signal::new(vec![vec![0.0; 1000], vec![0.0; 1000]], 44_100).unwrap();
        assert!(sig.is_stereo());
        assert_eq!(sig.len(), 1000);
    }
}

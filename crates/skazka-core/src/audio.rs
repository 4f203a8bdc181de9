//! Narration payload helpers
//!
//! Synthesized narration arrives as one base64 string of mono 16-bit PCM
//! samples at 24 kHz. The orchestrator treats it as opaque; these helpers
//! decode it for duration display and file export.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{StoryError, StoryResult};

/// Sample rate of synthesized narration.
pub const SAMPLE_RATE_HZ: u32 = 24_000;
/// Narration is single-channel.
pub const CHANNELS: u16 = 1;
/// Bits per PCM sample.
pub const BITS_PER_SAMPLE: u16 = 16;

/// Base64-encoded narration payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AudioClip(String);

impl AudioClip {
    pub fn new(base64_payload: impl Into<String>) -> Self {
        Self(base64_payload.into())
    }

    /// Encode raw samples into a payload. Used by tests and local tooling;
    /// real payloads come from the synthesis backend already encoded.
    pub fn from_samples(samples: &[i16]) -> Self {
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        Self(BASE64.encode(bytes))
    }

    /// The payload exactly as stored and mirrored.
    pub fn as_base64(&self) -> &str {
        &self.0
    }

    /// Decode to raw little-endian PCM bytes.
    pub fn decode_bytes(&self) -> StoryResult<Vec<u8>> {
        BASE64
            .decode(self.0.as_bytes())
            .map_err(|e| StoryError::Audio(format!("invalid base64 payload: {e}")))
    }

    /// Decode to 16-bit samples.
    pub fn decode_samples(&self) -> StoryResult<Vec<i16>> {
        let bytes = self.decode_bytes()?;
        if bytes.len() % 2 != 0 {
            return Err(StoryError::Audio(format!(
                "PCM payload has odd byte length {}",
                bytes.len()
            )));
        }
        Ok(bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }

    /// Narration length in seconds.
    pub fn duration_secs(&self) -> StoryResult<f64> {
        let samples = self.decode_samples()?;
        Ok(samples.len() as f64 / SAMPLE_RATE_HZ as f64)
    }
}

impl From<String> for AudioClip {
    fn from(payload: String) -> Self {
        Self(payload)
    }
}

//! # PCM Buffer Encoding
//!
//! Conversions between the three shapes a PCM16 buffer takes on its way through
//! the bridge:
//!
//! - **Sample arrays** (`Vec<i16>`): what the telephony carrier sends and expects,
//!   one JSON number per sample
//! - **Little-endian bytes**: the raw wire layout of 16-bit PCM
//! - **Base64 text**: how the speech agent carries audio inside JSON events
//!
//! None of these functions resample; they only change representation.

use base64::Engine;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

/// The two sample rates the bridge ever handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleRate {
    /// Narrowband telephony leg
    Telephony,
    /// Wideband speech agent leg
    Agent,
}

impl SampleRate {
    /// Sample rate in Hz.
    pub fn hz(self) -> u32 {
        match self {
            SampleRate::Telephony => 8_000,
            SampleRate::Agent => 24_000,
        }
    }

    /// Number of samples covering `ms` milliseconds at this rate.
    pub fn samples_for_ms(self, ms: u32) -> usize {
        (self.hz() as usize * ms as usize) / 1000
    }
}

/// Serialize samples as little-endian PCM16 bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(sample);
    }
    bytes
}

/// Parse little-endian PCM16 bytes into samples.
///
/// A trailing odd byte cannot form a sample and is dropped.
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    let even_len = bytes.len() - bytes.len() % 2;
    let mut samples = vec![0i16; even_len / 2];
    LittleEndian::read_i16_into(&bytes[..even_len], &mut samples);
    samples
}

/// Encode samples as base64 PCM16 (the agent's audio payload format).
pub fn encode_base64(samples: &[i16]) -> String {
    base64::engine::general_purpose::STANDARD.encode(samples_to_bytes(samples))
}

/// Decode a base64 PCM16 payload into samples.
pub fn decode_base64(payload: &str) -> Result<Vec<i16>, base64::DecodeError> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(payload)?;
    Ok(bytes_to_samples(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_little_endian_layout() {
        let bytes = samples_to_bytes(&[1, -2, 0x1234]);
        assert_eq!(bytes, vec![0x01, 0x00, 0xFE, 0xFF, 0x34, 0x12]);
        assert_eq!(bytes_to_samples(&bytes), vec![1, -2, 0x1234]);
    }

    #[test]
    fn test_odd_trailing_byte_is_dropped() {
        let samples = bytes_to_samples(&[0x10, 0x00, 0x7F]);
        assert_eq!(samples, vec![0x10]);
    }

    #[test]
    fn test_base64_payload() {
        // "AQD+/w==" is the base64 of [0x01, 0x00, 0xFE, 0xFF]
        assert_eq!(encode_base64(&[1, -2]), "AQD+/w==");
        assert_eq!(decode_base64("AQD+/w==").unwrap(), vec![1, -2]);
        assert!(decode_base64("not base64!").is_err());
    }

    #[test]
    fn test_sample_counts_per_rate() {
        assert_eq!(SampleRate::Telephony.samples_for_ms(2), 16);
        assert_eq!(SampleRate::Agent.samples_for_ms(20), 480);
    }
}

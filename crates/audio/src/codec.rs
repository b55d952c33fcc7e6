//! Opus codec wrappers.
//!
//! [`OpusStreamDecoder`] is session-scoped: one instance decodes the
//! client's uplink frames for the lifetime of the connection.
//! [`OpusFrameEncoder`] is used per synthesized file to produce
//! downlink frames.

use audiopus::coder::{Decoder, Encoder};
use audiopus::{Application, Channels, SampleRate, TryFrom};

use crate::AudioError;

/// Maximum size of an encoded Opus frame in bytes. Opus frames are
/// typically far smaller; this bound avoids truncation.
const MAX_OPUS_FRAME_BYTES: usize = 4000;

/// Maximum decoded samples per channel per frame (120 ms at 48 kHz).
const MAX_DECODED_SAMPLES_PER_CHANNEL: usize = 5760;

fn to_sample_rate(rate: u32) -> Result<SampleRate, AudioError> {
    <SampleRate as TryFrom<i32>>::try_from(rate as i32).map_err(|_| AudioError::UnsupportedRate(rate))
}

fn to_channels(channels: u8) -> Result<Channels, AudioError> {
    match channels {
        1 => Ok(Channels::Mono),
        2 => Ok(Channels::Stereo),
        other => Err(AudioError::UnsupportedChannels(other)),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream decoder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Stateful Opus decoder for client audio frames.
///
/// Decode failures are surfaced to the caller, which treats the frame
/// as raw PCM instead (some clients negotiate opus but send PCM).
pub struct OpusStreamDecoder {
    decoder: Decoder,
    channels: usize,
}

impl OpusStreamDecoder {
    pub fn new(sample_rate: u32, channels: u8) -> Result<Self, AudioError> {
        let decoder = Decoder::new(to_sample_rate(sample_rate)?, to_channels(channels)?)
            .map_err(|e| AudioError::Opus(format!("failed to create decoder: {e}")))?;
        Ok(Self {
            decoder,
            channels: channels as usize,
        })
    }

    /// Decode one Opus frame into interleaved 16-bit PCM.
    pub fn decode(&mut self, frame: &[u8]) -> Result<Vec<i16>, AudioError> {
        let mut pcm = vec![0i16; MAX_DECODED_SAMPLES_PER_CHANNEL * self.channels];
        let samples_per_channel = self
            .decoder
            .decode(Some(frame), &mut pcm, false)
            .map_err(|e| AudioError::Opus(format!("decode failed: {e}")))?;
        pcm.truncate(samples_per_channel * self.channels);
        Ok(pcm)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Frame encoder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One-shot Opus encoder configured for speech (VoIP application mode).
pub struct OpusFrameEncoder {
    encoder: Encoder,
}

impl OpusFrameEncoder {
    pub fn new(sample_rate: u32, channels: u8) -> Result<Self, AudioError> {
        let encoder = Encoder::new(
            to_sample_rate(sample_rate)?,
            to_channels(channels)?,
            Application::Voip,
        )
        .map_err(|e| AudioError::Opus(format!("failed to create encoder: {e}")))?;
        Ok(Self { encoder })
    }

    /// Encode one frame of interleaved PCM. The input length must be a
    /// valid Opus frame size for the configured rate (2.5–120 ms).
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, AudioError> {
        let mut out = vec![0u8; MAX_OPUS_FRAME_BYTES];
        let written = self
            .encoder
            .encode(pcm, &mut out)
            .map_err(|e| AudioError::Opus(format!("encode failed: {e}")))?;
        out.truncate(written);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_rejects_odd_sample_rate() {
        assert!(matches!(
            OpusStreamDecoder::new(22_050, 1),
            Err(AudioError::UnsupportedRate(22_050))
        ));
    }

    #[test]
    fn decoder_rejects_bad_channel_count() {
        assert!(matches!(
            OpusStreamDecoder::new(16_000, 3),
            Err(AudioError::UnsupportedChannels(3))
        ));
    }

    #[test]
    fn encode_then_decode_roundtrip_keeps_frame_size() {
        // 60 ms at 24 kHz mono.
        let samples = 24_000 * 60 / 1000;
        let pcm: Vec<i16> = (0..samples)
            .map(|i| ((i as f32 * 0.05).sin() * 8000.0) as i16)
            .collect();

        let mut enc = OpusFrameEncoder::new(24_000, 1).unwrap();
        let packet = enc.encode(&pcm).unwrap();
        assert!(!packet.is_empty());
        assert!(packet.len() < pcm.len() * 2);

        let mut dec = OpusStreamDecoder::new(24_000, 1).unwrap();
        let decoded = dec.decode(&packet).unwrap();
        assert_eq!(decoded.len(), samples);
    }

    #[test]
    fn garbage_frame_fails_decode() {
        let mut dec = OpusStreamDecoder::new(16_000, 1).unwrap();
        // Opus TOC bytes this malformed are rejected rather than decoded.
        assert!(dec.decode(&[0xff, 0xfe, 0x01]).is_err());
    }
}

//! Audio plumbing for the gateway: a stateful Opus decoder for client
//! uplink frames, and one-shot conversion of synthesized audio files
//! (mp3/wav) into wire frames in the negotiated downlink format.

pub mod codec;
pub mod file;

pub use codec::{OpusFrameEncoder, OpusStreamDecoder};
pub use file::{audio_to_frames, audio_to_opus_frames, audio_to_pcm_frames};

/// Errors specific to audio decode/encode.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("unsupported sample rate: {0}")]
    UnsupportedRate(u32),

    #[error("unsupported channel count: {0}")]
    UnsupportedChannels(u8),

    #[error("opus: {0}")]
    Opus(String),

    #[error("decode: {0}")]
    Decode(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

impl From<AudioError> for vx_domain::error::Error {
    fn from(e: AudioError) -> Self {
        vx_domain::error::Error::Audio(e.to_string())
    }
}

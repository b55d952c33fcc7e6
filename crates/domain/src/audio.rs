//! Audio format negotiation types.
//!
//! The client announces its capture format in the `hello` handshake;
//! the server always answers with its fixed downlink format (Opus,
//! 24 kHz mono, 60 ms frames). Client JSON is loosely typed — numeric
//! fields sometimes arrive as floats (`16000.0`) — so construction
//! from wire values goes through coercion helpers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Codec of an audio frame on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Pcm,
    Opus,
}

impl Default for AudioFormat {
    fn default() -> Self {
        AudioFormat::Opus
    }
}

/// Negotiated audio parameters for one direction of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioParams {
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub channels: u8,
    /// Nominal playout per frame, in milliseconds.
    pub frame_duration: u32,
}

impl AudioParams {
    /// The server downlink format: Opus, 24 kHz mono, 60 ms frames.
    pub fn server_default() -> Self {
        Self {
            format: AudioFormat::Opus,
            sample_rate: 24_000,
            channels: 1,
            frame_duration: 60,
        }
    }

    /// The assumed client uplink format when the hello omits params.
    pub fn client_default() -> Self {
        Self {
            format: AudioFormat::Opus,
            sample_rate: 16_000,
            channels: 1,
            frame_duration: 60,
        }
    }

    /// Samples per channel in one frame at these parameters.
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as usize * self.frame_duration as usize) / 1000
    }

    /// Parse from a loosely-typed `audio_params` JSON object.
    ///
    /// Missing fields fall back to the client defaults; numeric fields
    /// are coerced from integers, floats, or numeric strings.
    pub fn from_wire(value: &Value) -> Result<Self> {
        let defaults = Self::client_default();
        let obj = value
            .as_object()
            .ok_or_else(|| Error::Audio("audio_params is not an object".into()))?;

        let format = match obj.get("format").and_then(|v| v.as_str()) {
            Some("pcm") => AudioFormat::Pcm,
            Some("opus") | None => AudioFormat::Opus,
            Some(other) => {
                return Err(Error::Audio(format!("unsupported audio format: {other}")));
            }
        };

        Ok(Self {
            format,
            sample_rate: coerce_u32(obj.get("sample_rate")).unwrap_or(defaults.sample_rate),
            channels: coerce_u32(obj.get("channels")).unwrap_or(defaults.channels as u32) as u8,
            frame_duration: coerce_u32(obj.get("frame_duration")).unwrap_or(defaults.frame_duration),
        })
    }
}

/// Coerce a JSON value into a `u32`, accepting integers, floats, and
/// numeric strings.
pub fn coerce_u32(value: Option<&Value>) -> Option<u32> {
    match value? {
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                u32::try_from(u).ok()
            } else {
                n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u32)
            }
        }
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| *f >= 0.0).map(|f| f as u32),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_default_is_opus_24k_mono_60ms() {
        let p = AudioParams::server_default();
        assert_eq!(p.format, AudioFormat::Opus);
        assert_eq!(p.sample_rate, 24_000);
        assert_eq!(p.channels, 1);
        assert_eq!(p.frame_duration, 60);
        assert_eq!(p.samples_per_frame(), 1440);
    }

    #[test]
    fn from_wire_accepts_float_sample_rate() {
        let v = json!({"format": "opus", "sample_rate": 16000.0, "channels": 1, "frame_duration": 60});
        let p = AudioParams::from_wire(&v).unwrap();
        assert_eq!(p.sample_rate, 16_000);
    }

    #[test]
    fn from_wire_accepts_string_numbers() {
        let v = json!({"format": "pcm", "sample_rate": "8000", "channels": "2"});
        let p = AudioParams::from_wire(&v).unwrap();
        assert_eq!(p.format, AudioFormat::Pcm);
        assert_eq!(p.sample_rate, 8_000);
        assert_eq!(p.channels, 2);
        // frame_duration missing — falls back to the client default.
        assert_eq!(p.frame_duration, 60);
    }

    #[test]
    fn from_wire_rejects_unknown_format() {
        let v = json!({"format": "flac"});
        assert!(AudioParams::from_wire(&v).is_err());
    }

    #[test]
    fn from_wire_rejects_non_object() {
        assert!(AudioParams::from_wire(&json!("opus")).is_err());
    }

    #[test]
    fn coerce_rejects_negative_floats() {
        assert_eq!(coerce_u32(Some(&json!(-1.5))), None);
    }
}

//! Whisper-style speech recognition adapter.
//!
//! Posts the buffered utterance as a WAV upload to an OpenAI-compatible
//! `audio/transcriptions` endpoint and returns the transcript text.

use reqwest::multipart;

use crate::from_reqwest;
use crate::traits::AsrProvider;
use vx_domain::config::AsrProviderConfig;
use vx_domain::error::{Error, Result};

/// Encode mono 16-bit PCM as WAV bytes (44-byte RIFF header + data).
fn encode_wav(pcm: &[i16], sample_rate: u32) -> Vec<u8> {
    let num_samples = pcm.len() as u32;
    let bytes_per_sample: u16 = 2;
    let num_channels: u16 = 1;
    let data_size = num_samples * bytes_per_sample as u32;
    let file_size = 36 + data_size;

    let mut buf = Vec::with_capacity(44 + data_size as usize);

    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&file_size.to_le_bytes());
    buf.extend_from_slice(b"WAVE");

    // fmt sub-chunk
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM format
    buf.extend_from_slice(&num_channels.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    let byte_rate = sample_rate * num_channels as u32 * bytes_per_sample as u32;
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    let block_align = num_channels * bytes_per_sample;
    buf.extend_from_slice(&block_align.to_le_bytes());
    buf.extend_from_slice(&(bytes_per_sample * 8).to_le_bytes());

    // data sub-chunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_size.to_le_bytes());
    for &sample in pcm {
        buf.extend_from_slice(&sample.to_le_bytes());
    }

    buf
}

/// OpenAI-compatible `audio/transcriptions` adapter.
pub struct OpenAiAsr {
    id: String,
    base_url: String,
    api_key: String,
    model: String,
    language: String,
    client: reqwest::Client,
}

impl OpenAiAsr {
    pub fn from_config(id: &str, cfg: &AsrProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            id: id.to_string(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            language: cfg.language.clone(),
            client,
        })
    }
}

#[async_trait::async_trait]
impl AsrProvider for OpenAiAsr {
    async fn transcribe(&self, pcm: &[i16], sample_rate: u32) -> Result<String> {
        if pcm.is_empty() {
            return Ok(String::new());
        }

        let wav = encode_wav(pcm, sample_rate);
        tracing::debug!(provider = %self.id, bytes = wav.len(), "transcription request");

        let file_part = multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(from_reqwest)?;

        let mut form = multipart::Form::new()
            .text("model", self.model.clone())
            .part("file", file_part);
        if !self.language.is_empty() {
            form = form.text("language", self.language.clone());
        }

        let url = format!("{}/audio/transcriptions", self.base_url);
        let mut builder = self.client.post(&url).multipart(form);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }

        let resp = builder.send().await.map_err(from_reqwest)?;
        let status = resp.status();
        let body = resp.text().await.map_err(from_reqwest)?;

        if !status.is_success() {
            return Err(Error::Provider {
                provider: self.id.clone(),
                message: format!("HTTP {} - {}", status.as_u16(), body),
            });
        }

        let v: serde_json::Value = serde_json::from_str(&body)?;
        Ok(v.get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string())
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_header_shape() {
        let pcm = vec![0i16; 160];
        let wav = encode_wav(&pcm, 16_000);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + 320);
        // Sample rate field at offset 24.
        let rate = u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]);
        assert_eq!(rate, 16_000);
    }

    #[test]
    fn wav_data_is_little_endian() {
        let pcm = vec![0x0102i16];
        let wav = encode_wav(&pcm, 16_000);
        assert_eq!(&wav[44..46], &[0x02, 0x01]);
    }
}

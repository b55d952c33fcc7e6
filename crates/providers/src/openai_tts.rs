//! Speech synthesis adapter for OpenAI-compatible `audio/speech`
//! endpoints.
//!
//! Returns the raw audio body (mp3) written to a uniquely-named file
//! under the session's output directory; the frame sender converts it
//! to wire frames on its own schedule.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::from_reqwest;
use crate::traits::TtsProvider;
use vx_domain::config::TtsProviderConfig;
use vx_domain::error::{Error, Result};

/// OpenAI-compatible `audio/speech` adapter.
pub struct OpenAiTts {
    id: String,
    base_url: String,
    api_key: String,
    model: String,
    /// Mutable at runtime: the change_voice tool switches this.
    voice: RwLock<String>,
    speed: f32,
    client: reqwest::Client,
}

impl OpenAiTts {
    pub fn from_config(id: &str, cfg: &TtsProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            id: id.to_string(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            voice: RwLock::new(cfg.voice.clone()),
            speed: cfg.speed,
            client,
        })
    }
}

#[async_trait::async_trait]
impl TtsProvider for OpenAiTts {
    async fn synthesize(&self, text: &str, out_dir: &Path) -> Result<PathBuf> {
        let voice = self.voice.read().clone();
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": voice,
            "speed": self.speed,
            "response_format": "mp3",
        });

        let url = format!("{}/audio/speech", self.base_url);
        tracing::debug!(provider = %self.id, chars = text.chars().count(), "synthesis request");

        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }

        let resp = builder.json(&body).send().await.map_err(from_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(Error::Provider {
                provider: self.id.clone(),
                message: format!("HTTP {} - {}", status.as_u16(), err_text),
            });
        }

        let bytes = resp.bytes().await.map_err(from_reqwest)?;

        tokio::fs::create_dir_all(out_dir).await?;
        let path = out_dir.join(format!("tts-{}.mp3", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, &bytes).await?;

        Ok(path)
    }

    fn set_voice(&self, voice: &str) {
        *self.voice.write() = voice.to_string();
    }

    fn voice(&self) -> String {
        self.voice.read().clone()
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

//! The process-wide pool manager and the per-session provider set.
//!
//! A session leases one [`ProviderSet`] for its lifetime. Acquisition
//! happens in a fixed order (ASR → LLM → TTS → vision LLM → MCP) so two
//! sessions can never deadlock against each other, and any partial
//! acquisition is rolled back by destroying what was taken.

use std::sync::Arc;

use vx_domain::config::{
    AsrProviderConfig, Config, LlmProviderConfig, TtsProviderConfig,
};
use vx_domain::error::{Error, Result};
use vx_mcp::{McpClient, SessionMcp};

use crate::openai_asr::OpenAiAsr;
use crate::openai_llm::OpenAiLlm;
use crate::openai_tts::OpenAiTts;
use crate::pool::{Pool, PoolError, PoolFactory, PoolStats};
use crate::traits::{AsrProvider, LlmProvider, TtsProvider};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Factories
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct AsrFactory {
    id: String,
    cfg: AsrProviderConfig,
}

#[async_trait::async_trait]
impl PoolFactory for AsrFactory {
    type Item = Arc<dyn AsrProvider>;

    async fn create(&self) -> std::result::Result<Self::Item, PoolError> {
        let provider = OpenAiAsr::from_config(&self.id, &self.cfg)
            .map_err(|e| PoolError::Create(e.to_string()))?;
        Ok(Arc::new(provider))
    }

    async fn reset(&self, _item: &mut Self::Item) -> std::result::Result<(), PoolError> {
        // HTTP adapters keep no per-utterance state.
        Ok(())
    }

    async fn destroy(&self, _item: Self::Item) {}
}

struct LlmFactory {
    id: String,
    cfg: LlmProviderConfig,
}

#[async_trait::async_trait]
impl PoolFactory for LlmFactory {
    type Item = Arc<dyn LlmProvider>;

    async fn create(&self) -> std::result::Result<Self::Item, PoolError> {
        let provider = OpenAiLlm::from_config(&self.id, &self.cfg)
            .map_err(|e| PoolError::Create(e.to_string()))?;
        Ok(Arc::new(provider))
    }

    async fn reset(&self, _item: &mut Self::Item) -> std::result::Result<(), PoolError> {
        Ok(())
    }

    async fn destroy(&self, _item: Self::Item) {}
}

struct TtsFactory {
    id: String,
    cfg: TtsProviderConfig,
}

#[async_trait::async_trait]
impl PoolFactory for TtsFactory {
    type Item = Arc<dyn TtsProvider>;

    async fn create(&self) -> std::result::Result<Self::Item, PoolError> {
        let provider = OpenAiTts::from_config(&self.id, &self.cfg)
            .map_err(|e| PoolError::Create(e.to_string()))?;
        Ok(Arc::new(provider))
    }

    async fn reset(&self, item: &mut Self::Item) -> std::result::Result<(), PoolError> {
        // The previous session may have switched voices; the next one
        // must start from the configured default.
        item.set_voice(&self.cfg.voice);
        Ok(())
    }

    async fn destroy(&self, _item: Self::Item) {}
}

struct McpFactory {
    shared: Vec<Arc<dyn McpClient>>,
}

#[async_trait::async_trait]
impl PoolFactory for McpFactory {
    type Item = Arc<SessionMcp>;

    async fn create(&self) -> std::result::Result<Self::Item, PoolError> {
        Ok(Arc::new(SessionMcp::new(self.shared.clone())))
    }

    async fn reset(&self, item: &mut Self::Item) -> std::result::Result<(), PoolError> {
        item.reset();
        Ok(())
    }

    async fn destroy(&self, item: Self::Item) {
        item.device.close();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ProviderSet
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything one session needs, acquired together and owned
/// exclusively until release. Releasing clears every field so a stale
/// handle cannot reach a provider another session now owns.
pub struct ProviderSet {
    pub asr: Option<Arc<dyn AsrProvider>>,
    pub llm: Option<Arc<dyn LlmProvider>>,
    pub tts: Option<Arc<dyn TtsProvider>>,
    pub vllm: Option<Arc<dyn LlmProvider>>,
    pub mcp: Option<Arc<SessionMcp>>,
}

impl ProviderSet {
    pub fn is_released(&self) -> bool {
        self.asr.is_none()
            && self.llm.is_none()
            && self.tts.is_none()
            && self.vllm.is_none()
            && self.mcp.is_none()
    }
}

/// Aggregate view over every pool, for logs and diagnostics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ManagerStats {
    pub asr: PoolStats,
    pub llm: PoolStats,
    pub tts: PoolStats,
    pub vllm: Option<PoolStats>,
    pub mcp: PoolStats,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PoolManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One pool per provider kind, built from the `[selected]` config.
pub struct PoolManager {
    asr: Pool<AsrFactory>,
    llm: Pool<LlmFactory>,
    tts: Pool<TtsFactory>,
    vllm: Option<Pool<LlmFactory>>,
    mcp: Pool<McpFactory>,
    warm_size: usize,
}

impl PoolManager {
    /// Build pools for the selected providers. `shared_mcp` are the
    /// process-wide MCP clients (local handlers + stdio servers) every
    /// session's router starts from.
    pub fn from_config(config: &Config, shared_mcp: Vec<Arc<dyn McpClient>>) -> Result<Self> {
        let warm_size = config.pool.warm_size;

        let asr_id = &config.selected.asr;
        let asr_cfg = config
            .providers
            .asr
            .get(asr_id)
            .ok_or_else(|| Error::Config(format!("selected.asr '{asr_id}' not configured")))?;

        let llm_id = &config.selected.llm;
        let llm_cfg = config
            .providers
            .llm
            .get(llm_id)
            .ok_or_else(|| Error::Config(format!("selected.llm '{llm_id}' not configured")))?;

        let tts_id = &config.selected.tts;
        let tts_cfg = config
            .providers
            .tts
            .get(tts_id)
            .ok_or_else(|| Error::Config(format!("selected.tts '{tts_id}' not configured")))?;

        let vllm = match &config.selected.vllm {
            Some(vllm_id) => {
                let cfg = config.providers.llm.get(vllm_id).ok_or_else(|| {
                    Error::Config(format!("selected.vllm '{vllm_id}' not configured"))
                })?;
                Some(Pool::new(
                    LlmFactory {
                        id: vllm_id.clone(),
                        cfg: cfg.clone(),
                    },
                    warm_size,
                ))
            }
            None => None,
        };

        Ok(Self {
            asr: Pool::new(
                AsrFactory {
                    id: asr_id.clone(),
                    cfg: asr_cfg.clone(),
                },
                warm_size,
            ),
            llm: Pool::new(
                LlmFactory {
                    id: llm_id.clone(),
                    cfg: llm_cfg.clone(),
                },
                warm_size,
            ),
            tts: Pool::new(
                TtsFactory {
                    id: tts_id.clone(),
                    cfg: tts_cfg.clone(),
                },
                warm_size,
            ),
            vllm,
            mcp: Pool::new(McpFactory { shared: shared_mcp }, warm_size),
            warm_size,
        })
    }

    /// Pre-create providers in every pool.
    pub async fn warmup(&self) {
        let n = self.warm_size;
        self.asr.warmup(n).await;
        self.llm.warmup(n).await;
        self.tts.warmup(n).await;
        if let Some(vllm) = &self.vllm {
            vllm.warmup(n).await;
        }
        self.mcp.warmup(n).await;
        tracing::info!(warm_size = n, "provider pools warmed");
    }

    /// Acquire a full set in the fixed order, rolling back partial
    /// acquisitions by destroying what was already taken.
    pub async fn acquire(&self) -> Result<ProviderSet> {
        let asr = self.asr.acquire().await?;

        let llm = match self.llm.acquire().await {
            Ok(p) => p,
            Err(e) => {
                self.asr.drop_item(asr).await;
                return Err(e.into());
            }
        };

        let tts = match self.tts.acquire().await {
            Ok(p) => p,
            Err(e) => {
                self.asr.drop_item(asr).await;
                self.llm.drop_item(llm).await;
                return Err(e.into());
            }
        };

        let vllm = match &self.vllm {
            Some(pool) => match pool.acquire().await {
                Ok(p) => Some(p),
                Err(e) => {
                    self.asr.drop_item(asr).await;
                    self.llm.drop_item(llm).await;
                    self.tts.drop_item(tts).await;
                    return Err(e.into());
                }
            },
            None => None,
        };

        let mcp = match self.mcp.acquire().await {
            Ok(p) => p,
            Err(e) => {
                self.asr.drop_item(asr).await;
                self.llm.drop_item(llm).await;
                self.tts.drop_item(tts).await;
                if let (Some(pool), Some(v)) = (&self.vllm, vllm) {
                    pool.drop_item(v).await;
                }
                return Err(e.into());
            }
        };

        Ok(ProviderSet {
            asr: Some(asr),
            llm: Some(llm),
            tts: Some(tts),
            vllm,
            mcp: Some(mcp),
        })
    }

    /// Release every populated member back to its pool, collecting
    /// errors. The set's fields are cleared regardless, so release is
    /// effective exactly once.
    pub async fn release(&self, set: &mut ProviderSet) -> Result<()> {
        let mut first_err: Option<Error> = None;
        let mut record = |r: std::result::Result<(), PoolError>| {
            if let Err(e) = r {
                tracing::warn!(error = %e, "provider release failed, item destroyed");
                if first_err.is_none() {
                    first_err = Some(e.into());
                }
            }
        };

        if let Some(asr) = set.asr.take() {
            record(self.asr.release(asr).await);
        }
        if let Some(llm) = set.llm.take() {
            record(self.llm.release(llm).await);
        }
        if let Some(tts) = set.tts.take() {
            record(self.tts.release(tts).await);
        }
        if let Some(vllm) = set.vllm.take() {
            match &self.vllm {
                Some(pool) => record(pool.release(vllm).await),
                None => drop(vllm),
            }
        }
        if let Some(mcp) = set.mcp.take() {
            record(self.mcp.release(mcp).await);
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Close every pool; parked providers are destroyed and new
    /// acquires fail.
    pub async fn close(&self) {
        self.asr.close().await;
        self.llm.close().await;
        self.tts.close().await;
        if let Some(vllm) = &self.vllm {
            vllm.close().await;
        }
        self.mcp.close().await;
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            asr: self.asr.stats(),
            llm: self.llm.stats(),
            tts: self.tts.stats(),
            vllm: self.vllm.as_ref().map(|p| p.stats()),
            mcp: self.mcp.stats(),
        }
    }
}

//! Provider adapters and the per-kind provider pools.
//!
//! Each session leases an exclusive [`ProviderSet`] (ASR + LLM + TTS +
//! optional vision LLM + MCP) from the [`PoolManager`] for its whole
//! lifetime and returns it on close. Adapters speak OpenAI-compatible
//! HTTP APIs; anything matching that contract (OpenAI, Ollama, vLLM,
//! local gateways) plugs in through config.

pub mod manager;
pub mod openai_asr;
pub mod openai_llm;
pub mod openai_tts;
pub mod pool;
pub mod sse;
pub mod traits;

pub use manager::{PoolManager, ProviderSet};
pub use pool::{Pool, PoolError, PoolFactory, PoolStats};
pub use traits::{AsrProvider, ChatRequest, LlmProvider, TtsProvider};

use vx_domain::error::Error;

/// Map a `reqwest` error onto the shared error type.
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

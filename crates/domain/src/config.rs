use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub selected: SelectedConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub audio: AudioPolicyConfig,
    #[serde(default)]
    pub dialogue: DialogueConfig,
    #[serde(default)]
    pub wake: WakeConfig,
    /// Utterances that end the session when spoken verbatim.
    #[serde(default = "d_exit_commands")]
    pub exit_commands: Vec<String>,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub mcp: McpConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            selected: SelectedConfig::default(),
            pool: PoolConfig::default(),
            audio: AudioPolicyConfig::default(),
            dialogue: DialogueConfig::default(),
            wake: WakeConfig::default(),
            exit_commands: d_exit_commands(),
            providers: ProvidersConfig::default(),
            mcp: McpConfig::default(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8990,
            host: "0.0.0.0".into(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider selection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which configured provider each pool is built from. The names refer
/// to keys in [`ProvidersConfig`]; `vllm` is optional (vision turns
/// fail softly without it).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SelectedConfig {
    #[serde(default)]
    pub asr: String,
    #[serde(default)]
    pub llm: String,
    #[serde(default)]
    pub tts: String,
    #[serde(default)]
    pub vllm: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Providers pre-created and parked per kind.
    #[serde(default = "d_warm_size")]
    pub warm_size: usize,
    /// Warm the pools at startup rather than on first acquire.
    #[serde(default = "d_true")]
    pub warmup_on_start: bool,
    /// How long an acceptor waits for a provider set before closing
    /// the connection.
    #[serde(default = "d_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            warm_size: 2,
            warmup_on_start: true,
            acquire_timeout_ms: 5_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Audio policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioPolicyConfig {
    /// Delete synthesized audio files once sent (music files are kept).
    #[serde(default = "d_true")]
    pub delete_audio: bool,
    /// Directory for synthesized speech files.
    #[serde(default = "d_audio_out")]
    pub output_dir: PathBuf,
    /// Directory searched by the play_music tool.
    #[serde(default = "d_music_dir")]
    pub music_dir: PathBuf,
}

impl Default for AudioPolicyConfig {
    fn default() -> Self {
        Self {
            delete_audio: true,
            output_dir: d_audio_out(),
            music_dir: d_music_dir(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dialogue
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueConfig {
    /// Non-system messages kept when the buffer is truncated.
    #[serde(default = "d_max_history")]
    pub max_history: usize,
    #[serde(default = "d_system_prompt")]
    pub system_prompt: String,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            max_history: 16,
            system_prompt: d_system_prompt(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wake word
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeConfig {
    /// Phrases that trigger the quick-reply fast path.
    #[serde(default = "d_wake_words")]
    pub words: Vec<String>,
    /// Replies chosen at random by the fast path.
    #[serde(default = "d_quick_replies")]
    pub quick_replies: Vec<String>,
    /// Minimum seconds between fast-path activations.
    #[serde(default = "d_wake_throttle")]
    pub throttle_secs: u64,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            words: d_wake_words(),
            quick_replies: d_quick_replies(),
            throttle_secs: 3,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Providers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub asr: HashMap<String, AsrProviderConfig>,
    #[serde(default)]
    pub llm: HashMap<String, LlmProviderConfig>,
    #[serde(default)]
    pub tts: HashMap<String, TtsProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrProviderConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "d_asr_model")]
    pub model: String,
    /// Hint passed to the recognizer; empty = auto-detect.
    #[serde(default)]
    pub language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProviderConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "d_llm_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsProviderConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "d_tts_model")]
    pub model: String,
    #[serde(default = "d_tts_voice")]
    pub voice: String,
    #[serde(default = "d_speed")]
    pub speed: f32,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MCP
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct McpConfig {
    /// External stdio-spawned tool servers, initialized at startup.
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Config {
    /// Check the configuration for problems. Errors make startup fail;
    /// warnings are logged and ignored.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        let err = |issues: &mut Vec<ConfigIssue>, m: String| {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: m,
            })
        };
        let warn = |issues: &mut Vec<ConfigIssue>, m: String| {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: m,
            })
        };

        if self.selected.asr.is_empty() {
            err(&mut issues, "selected.asr is empty".into());
        } else if !self.providers.asr.contains_key(&self.selected.asr) {
            err(
                &mut issues,
                format!("selected.asr '{}' has no [providers.asr] entry", self.selected.asr),
            );
        }
        if self.selected.llm.is_empty() {
            err(&mut issues, "selected.llm is empty".into());
        } else if !self.providers.llm.contains_key(&self.selected.llm) {
            err(
                &mut issues,
                format!("selected.llm '{}' has no [providers.llm] entry", self.selected.llm),
            );
        }
        if self.selected.tts.is_empty() {
            err(&mut issues, "selected.tts is empty".into());
        } else if !self.providers.tts.contains_key(&self.selected.tts) {
            err(
                &mut issues,
                format!("selected.tts '{}' has no [providers.tts] entry", self.selected.tts),
            );
        }
        if let Some(vllm) = &self.selected.vllm {
            if !self.providers.llm.contains_key(vllm) {
                err(
                    &mut issues,
                    format!("selected.vllm '{vllm}' has no [providers.llm] entry"),
                );
            }
        }

        if self.wake.quick_replies.is_empty() {
            warn(
                &mut issues,
                "wake.quick_replies is empty; the wake fast path will stay silent".into(),
            );
        }
        if self.pool.warm_size > 32 {
            warn(
                &mut issues,
                format!("pool.warm_size {} is unusually large", self.pool.warm_size),
            );
        }
        if self.dialogue.max_history < 2 {
            warn(
                &mut issues,
                "dialogue.max_history < 2 loses tool-call context between turns".into(),
            );
        }

        issues
    }
}

// ── Serde default helpers ──────────────────────────────────────────

fn d_port() -> u16 {
    8990
}
fn d_host() -> String {
    "0.0.0.0".into()
}
fn d_true() -> bool {
    true
}
fn d_warm_size() -> usize {
    2
}
fn d_acquire_timeout_ms() -> u64 {
    5_000
}
fn d_audio_out() -> PathBuf {
    PathBuf::from("tmp/audio")
}
fn d_music_dir() -> PathBuf {
    PathBuf::from("music")
}
fn d_max_history() -> usize {
    16
}
fn d_system_prompt() -> String {
    "You are a friendly voice assistant. Answer briefly and conversationally; \
     your replies are spoken aloud."
        .into()
}
fn d_wake_words() -> Vec<String> {
    vec!["你好小智".into(), "小智小智".into(), "hey vox".into()]
}
fn d_quick_replies() -> Vec<String> {
    vec!["我在".into(), "在呢".into(), "来了".into()]
}
fn d_wake_throttle() -> u64 {
    3
}
fn d_exit_commands() -> Vec<String> {
    vec!["退出".into(), "再见".into(), "exit".into(), "goodbye".into()]
}
fn d_asr_model() -> String {
    "whisper-1".into()
}
fn d_llm_model() -> String {
    "gpt-4o-mini".into()
}
fn d_tts_model() -> String {
    "tts-1".into()
}
fn d_tts_voice() -> String {
    "alloy".into()
}
fn d_speed() -> f32 {
    1.0
}

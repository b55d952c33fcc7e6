//! Defaults and validation behavior for the config tree.

use vx_domain::config::{Config, ConfigSeverity};

#[test]
fn empty_toml_yields_defaults() {
    let config: Config = toml::from_str("").unwrap();
    assert_eq!(config.server.port, 8990);
    assert_eq!(config.server.host, "0.0.0.0");
    assert_eq!(config.pool.warm_size, 2);
    assert!(config.pool.warmup_on_start);
    assert!(config.audio.delete_audio);
    assert_eq!(config.dialogue.max_history, 16);
    assert_eq!(config.wake.throttle_secs, 3);
    assert!(!config.exit_commands.is_empty());
}

#[test]
fn empty_selection_is_an_error() {
    let config: Config = toml::from_str("").unwrap();
    let issues = config.validate();
    let errors: Vec<_> = issues
        .iter()
        .filter(|i| i.severity == ConfigSeverity::Error)
        .collect();
    // asr, llm, tts all unselected.
    assert_eq!(errors.len(), 3);
}

#[test]
fn selection_must_reference_configured_provider() {
    let raw = r#"
        [selected]
        asr = "a1"
        llm = "l1"
        tts = "t1"

        [providers.asr.a1]
        base_url = "http://localhost:9000/v1"

        [providers.llm.l1]
        base_url = "http://localhost:11434/v1"

        [providers.tts.t1]
        base_url = "http://localhost:9880/v1"
    "#;
    let config: Config = toml::from_str(raw).unwrap();
    assert!(config
        .validate()
        .iter()
        .all(|i| i.severity != ConfigSeverity::Error));
}

#[test]
fn dangling_vllm_selection_is_an_error() {
    let raw = r#"
        [selected]
        asr = "a1"
        llm = "l1"
        tts = "t1"
        vllm = "nope"

        [providers.asr.a1]
        base_url = "http://localhost:9000/v1"

        [providers.llm.l1]
        base_url = "http://localhost:11434/v1"

        [providers.tts.t1]
        base_url = "http://localhost:9880/v1"
    "#;
    let config: Config = toml::from_str(raw).unwrap();
    assert!(config
        .validate()
        .iter()
        .any(|i| i.severity == ConfigSeverity::Error && i.message.contains("vllm")));
}

#[test]
fn provider_defaults_fill_in() {
    let raw = r#"
        [providers.llm.l1]
        base_url = "http://localhost:11434/v1"
    "#;
    let config: Config = toml::from_str(raw).unwrap();
    let llm = &config.providers.llm["l1"];
    assert_eq!(llm.model, "gpt-4o-mini");
    assert!(llm.api_key.is_empty());
    assert!(llm.temperature.is_none());
}

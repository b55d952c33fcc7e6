//! End-to-end pool manager behavior against a full config.

use std::sync::Arc;

use vx_mcp::{LocalToolClient, McpClient};
use vx_providers::PoolManager;

fn test_config() -> vx_domain::config::Config {
    let raw = r#"
        [pool]
        warm_size = 2
        warmup_on_start = false

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
        voice = "alloy"
    "#;
    toml::from_str(raw).unwrap()
}

fn shared_clients() -> Vec<Arc<dyn McpClient>> {
    vec![Arc::new(LocalToolClient::new()) as Arc<dyn McpClient>]
}

#[tokio::test]
async fn acquire_yields_a_complete_set() {
    let manager = PoolManager::from_config(&test_config(), shared_clients()).unwrap();
    let set = manager.acquire().await.unwrap();

    assert!(set.asr.is_some());
    assert!(set.llm.is_some());
    assert!(set.tts.is_some());
    assert!(set.vllm.is_none()); // not selected
    assert!(set.mcp.is_some());

    let stats = manager.stats();
    assert_eq!(stats.asr.in_use, 1);
    assert_eq!(stats.llm.in_use, 1);
    assert_eq!(stats.tts.in_use, 1);
    assert_eq!(stats.mcp.in_use, 1);
}

#[tokio::test]
async fn release_clears_the_set_and_returns_members() {
    let manager = PoolManager::from_config(&test_config(), shared_clients()).unwrap();
    let mut set = manager.acquire().await.unwrap();

    manager.release(&mut set).await.unwrap();
    assert!(set.is_released());

    let stats = manager.stats();
    assert_eq!(stats.asr.in_use, 0);
    // Each pool keeps the item warm or idle.
    assert_eq!(stats.asr.warmed as usize + stats.asr.idle, 1);
    assert!(stats.asr.created >= stats.asr.in_use);
}

#[tokio::test]
async fn double_release_is_a_noop() {
    let manager = PoolManager::from_config(&test_config(), shared_clients()).unwrap();
    let mut set = manager.acquire().await.unwrap();

    manager.release(&mut set).await.unwrap();
    let before = manager.stats();
    manager.release(&mut set).await.unwrap();
    let after = manager.stats();

    assert_eq!(before.asr.warmed, after.asr.warmed);
    assert_eq!(before.asr.idle, after.asr.idle);
    assert_eq!(before.asr.created, after.asr.created);
}

#[tokio::test]
async fn warmup_makes_acquire_reuse_providers() {
    let manager = PoolManager::from_config(&test_config(), shared_clients()).unwrap();
    manager.warmup().await;

    let created_before = manager.stats().llm.created;
    assert_eq!(created_before, 2);

    let mut set = manager.acquire().await.unwrap();
    // Acquire drained the warm channel instead of creating.
    assert_eq!(manager.stats().llm.created, created_before);
    manager.release(&mut set).await.unwrap();
}

#[tokio::test]
async fn closed_manager_rejects_new_sessions() {
    let manager = PoolManager::from_config(&test_config(), shared_clients()).unwrap();
    manager.close().await;
    assert!(manager.acquire().await.is_err());
}

#[tokio::test]
async fn three_sessions_share_two_warm_providers() {
    let manager = Arc::new(PoolManager::from_config(&test_config(), shared_clients()).unwrap());
    manager.warmup().await;

    let mut s1 = manager.acquire().await.unwrap();
    let mut s2 = manager.acquire().await.unwrap();
    // Third session: warm pool is drained, so it creates.
    let mut s3 = manager.acquire().await.unwrap();

    let stats = manager.stats();
    assert_eq!(stats.llm.in_use, 3);
    assert_eq!(stats.llm.created, 3);

    manager.release(&mut s1).await.unwrap();
    manager.release(&mut s2).await.unwrap();
    manager.release(&mut s3).await.unwrap();
    assert_eq!(manager.stats().llm.in_use, 0);
}

#[tokio::test]
async fn tts_voice_resets_on_release() {
    let manager = PoolManager::from_config(&test_config(), shared_clients()).unwrap();
    let mut set = manager.acquire().await.unwrap();

    set.tts.as_ref().unwrap().set_voice("nova");
    manager.release(&mut set).await.unwrap();

    // Whoever acquires next sees the configured default again.
    let set2 = manager.acquire().await.unwrap();
    assert_eq!(set2.tts.as_ref().unwrap().voice(), "alloy");
}

#[tokio::test]
async fn missing_selected_provider_is_a_config_error() {
    let mut config = test_config();
    config.selected.llm = "ghost".into();
    assert!(PoolManager::from_config(&config, shared_clients()).is_err());
}

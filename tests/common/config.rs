//! Test configuration and manager construction over an in-memory article store

use media_acquire::config::ProviderConfig;
use media_acquire::{Config, DownloadManager, InMemoryConnector};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A manager, its article store and the directory holding its state
pub struct Harness {
    pub manager: DownloadManager,
    pub connector: InMemoryConnector,
    pub dir: TempDir,
}

/// Provider with the given connection limit and priority
pub fn provider(name: &str, connections: usize, priority: i32) -> ProviderConfig {
    let mut config = ProviderConfig::new(name, format!("{name}.invalid"));
    config.connections = connections;
    config.priority = priority;
    config
}

/// Configuration rooted in `dir` with short timeouts and no retries
pub fn test_config(dir: &Path, providers: Vec<ProviderConfig>) -> Config {
    let mut config = Config {
        providers,
        ..Default::default()
    };
    config.download.download_dir = dir.join("downloads");
    config.download.temp_dir = dir.join("temp");
    config.download.max_concurrent_jobs = 1;
    config.download.max_retries = 0;
    config.download.acquire_timeout = Duration::from_secs(2);
    config.download.cancel_timeout = Duration::from_secs(5);
    config.download.progress_interval = Duration::from_millis(20);
    config.persistence.database_path = dir.join("media-acquire.db");
    config.tools.search_path = false;
    config.transcode.enabled = false;
    config
}

/// Build a manager over a fresh in-memory store; `tweak` adjusts the config
pub async fn harness(
    providers: Vec<ProviderConfig>,
    tweak: impl FnOnce(&mut Config),
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let connector = InMemoryConnector::new();
    let mut config = test_config(dir.path(), providers);
    tweak(&mut config);

    let manager = DownloadManager::builder(config)
        .connector(Arc::new(connector.clone()))
        .without_encoder()
        .build()
        .await
        .unwrap();
    Harness {
        manager,
        connector,
        dir,
    }
}

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use command_delivery::routing::load_mapping_file;
use command_delivery::DeviceTypeMappingRouter;
use health::HealthHandle;
use telemetry_common::error::ConfigurationError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::metrics_consts::{MAPPING_RELOADS, MAPPING_RELOAD_FAILURES};

/// Swaps the router's table whenever the mapping file changes on disk. A
/// file that fails to load leaves the current table in place.
pub struct MappingReloader {
    router: Arc<DeviceTypeMappingRouter>,
    path: PathBuf,
    last_modified: Option<SystemTime>,
}

impl MappingReloader {
    /// `router` is expected to hold the table loaded from `path` already.
    pub fn new(router: Arc<DeviceTypeMappingRouter>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let last_modified = modified(&path).ok();
        Self {
            router,
            path,
            last_modified,
        }
    }

    /// Returns whether the table was replaced.
    pub fn reload_if_changed(&mut self) -> Result<bool, ConfigurationError> {
        let modified = modified(&self.path)?;
        if self.last_modified == Some(modified) {
            return Ok(false);
        }

        let table = load_mapping_file(&self.path)?;
        self.router.replace(table);
        self.last_modified = Some(modified);
        Ok(true)
    }

    /// Checks the file every `interval` until `shutdown` turns true,
    /// reporting to `liveness` after each check, failed or not.
    pub fn spawn(
        mut self,
        interval: Duration,
        liveness: Option<HealthHandle>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }

                match self.reload_if_changed() {
                    Ok(true) => {
                        metrics::counter!(MAPPING_RELOADS).increment(1);
                        info!(path = %self.path.display(), "reloaded destination mapping");
                    }
                    Ok(false) => {}
                    Err(e) => {
                        metrics::counter!(MAPPING_RELOAD_FAILURES).increment(1);
                        warn!(
                            path = %self.path.display(),
                            "keeping current destination mapping: {}",
                            e
                        );
                    }
                }
                if let Some(liveness) = &liveness {
                    liveness.report_healthy().await;
                }
            }
            info!("mapping reload task stopped");
        })
    }
}

fn modified(path: &Path) -> Result<SystemTime, ConfigurationError> {
    std::fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .map_err(|e| ConfigurationError::MappingFile(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIRST: &str = r#"{"mappings": [{"deviceType": "tracker", "destinations": ["mqtt"]}]}"#;
    const SECOND: &str = r#"{"mappings": [{"deviceType": "tracker", "destinations": ["coap"]}]}"#;

    fn write(path: &Path, contents: &str, modified: SystemTime) {
        std::fs::write(path, contents).unwrap();
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(modified)
            .unwrap();
    }

    #[test]
    fn reloads_only_when_the_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.json");
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        write(&path, FIRST, start);

        let router = Arc::new(DeviceTypeMappingRouter::new(
            load_mapping_file(&path).unwrap(),
        ));
        let mut reloader = MappingReloader::new(router.clone(), &path);
        assert!(!reloader.reload_if_changed().unwrap());

        write(&path, SECOND, start + Duration::from_secs(60));
        assert!(reloader.reload_if_changed().unwrap());
        assert_eq!(
            router.resolve_destinations("tracker").unwrap()[0].as_str(),
            "coap"
        );
        assert!(!reloader.reload_if_changed().unwrap());
    }

    #[test]
    fn broken_file_keeps_the_current_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.json");
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        write(&path, FIRST, start);

        let router = Arc::new(DeviceTypeMappingRouter::new(
            load_mapping_file(&path).unwrap(),
        ));
        let mut reloader = MappingReloader::new(router.clone(), &path);

        write(&path, "{not json", start + Duration::from_secs(60));
        assert!(reloader.reload_if_changed().is_err());
        assert_eq!(
            router.resolve_destinations("tracker").unwrap()[0].as_str(),
            "mqtt"
        );
    }

    #[tokio::test]
    async fn task_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.json");
        std::fs::write(&path, FIRST).unwrap();
        let router = Arc::new(DeviceTypeMappingRouter::new(
            load_mapping_file(&path).unwrap(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = MappingReloader::new(router, &path).spawn(
            Duration::from_millis(10),
            None,
            shutdown_rx,
        );
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn task_reports_liveness_after_each_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.json");
        std::fs::write(&path, FIRST).unwrap();
        let router = Arc::new(DeviceTypeMappingRouter::new(
            load_mapping_file(&path).unwrap(),
        ));

        let registry = health::HealthRegistry::new("liveness");
        let handle = registry
            .register("mapping-reload".to_string(), Duration::from_secs(30))
            .await;
        assert!(!registry.get_status().healthy);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = MappingReloader::new(router, &path).spawn(
            Duration::from_millis(10),
            Some(handle),
            shutdown_rx,
        );

        let mut healthy = false;
        for _ in 0..100 {
            if registry.get_status().healthy {
                healthy = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(healthy, "reload task never reported healthy");

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}

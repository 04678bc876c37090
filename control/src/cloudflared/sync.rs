//! Config sync loop
//!
//! Mirrors the ingress tracker into the cloudflared configuration file. The
//! file is rewritten only when the rendered content changes, so the daemon's
//! file watcher does not see spurious reloads.

use crate::apis::metrics::record_config_write;
use crate::cloudflared::config::{write_if_changed, TunnelConfig};
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::tracker::IngressTracker;
use common::IngressRecord;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ConfigSync {
    tracker: Arc<IngressTracker>,
    path: PathBuf,
    tunnel_id: Option<String>,
    credentials_file: Option<PathBuf>,
}

impl ConfigSync {
    pub fn new(tracker: Arc<IngressTracker>, config: &ControllerConfig) -> Self {
        Self {
            tracker,
            path: config.config_path.clone(),
            tunnel_id: config.tunnel_id.clone(),
            credentials_file: config.credentials_file.clone(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Render the current tracker snapshot
    pub fn render(&self) -> Result<String, ControllerError> {
        self.render_records(&self.tracker.snapshot())
    }

    fn render_records(&self, records: &[IngressRecord]) -> Result<String, ControllerError> {
        TunnelConfig::from_records(
            self.tunnel_id.clone(),
            self.credentials_file.clone(),
            records,
        )
        .render()
    }

    /// Write the current snapshot if it differs from the file on disk
    ///
    /// Returns true if the file was rewritten.
    pub fn sync_once(&self) -> Result<bool, ControllerError> {
        let records = self.tracker.snapshot();
        let content = self.render_records(&records)?;
        let written = write_if_changed(&self.path, &content)?;
        if written {
            info!(
                "Wrote tunnel configuration {} ({} ingress rules)",
                self.path.display(),
                records.len()
            );
        }
        Ok(written)
    }

    /// Log what the file on disk routes before it is first replaced
    async fn log_existing(&self) {
        let path = self.path.clone();
        match tokio::task::spawn_blocking(move || TunnelConfig::load(&path)).await {
            Ok(Ok(existing)) => info!(
                "Existing tunnel configuration routes {} hostnames",
                existing.hostnames().len()
            ),
            Ok(Err(e)) => warn!("Existing tunnel configuration will be replaced: {}", e),
            Err(e) => warn!("Config load task failed: {}", e),
        }
    }

    /// Sync at start, on every tracker change and every `interval`
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        info!(
            "Starting config sync to {} every {:?}",
            self.path.display(),
            interval
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately; the initial sync covers it
        ticker.tick().await;
        self.log_existing().await;

        loop {
            self.sync_and_record().await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.tracker.changed() => debug!("Ingress tracker changed"),
                _ = ticker.tick() => {}
            }
        }

        info!("Config sync stopped");
    }

    async fn sync_and_record(self: &Arc<Self>) {
        let sync = self.clone();
        let result = tokio::task::spawn_blocking(move || sync.sync_once()).await;

        match result {
            Ok(Ok(true)) => record_config_write("written"),
            Ok(Ok(false)) => record_config_write("unchanged"),
            Ok(Err(e)) => {
                warn!("Failed to write tunnel configuration: {}", e);
                record_config_write("error");
            }
            Err(e) => {
                warn!("Config sync task failed: {}", e);
                record_config_write("error");
            }
        }
    }
}

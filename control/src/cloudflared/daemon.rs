//! cloudflared process supervisor
//!
//! Runs the tunnel daemon against the generated configuration file. The
//! daemon reloads the file itself; this module only starts and stops it.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CloudflaredDaemon {
    binary: PathBuf,
    config_path: PathBuf,
    tunnel_id: Option<String>,
}

impl CloudflaredDaemon {
    pub fn new(binary: PathBuf, config_path: PathBuf, tunnel_id: Option<String>) -> Self {
        Self {
            binary,
            config_path,
            tunnel_id,
        }
    }

    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::new(
            PathBuf::from(&config.daemon.binary),
            config.config_path.clone(),
            config.tunnel_id.clone(),
        )
    }

    /// Command line arguments
    ///
    /// Without a tunnel ID cloudflared starts an ephemeral quick tunnel.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--no-autoupdate".to_string(),
            "--config".to_string(),
            self.config_path.display().to_string(),
        ];
        if self.tunnel_id.is_some() {
            args.push("tunnel".to_string());
            args.push("run".to_string());
        }
        args
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .args(self.args())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }

    /// Run the daemon until it exits or `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        let mut child = self.command().spawn()?;
        info!(
            "Started {} (pid {:?}) with {:?}",
            self.binary.display(),
            child.id(),
            self.args()
        );

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if status.success() {
                    info!("cloudflared exited");
                } else {
                    warn!("cloudflared exited with {}", status);
                }
            }
            _ = shutdown.cancelled() => {
                info!("Stopping cloudflared");
                if let Err(e) = child.kill().await {
                    warn!("Failed to stop cloudflared: {}", e);
                }
            }
        }

        Ok(())
    }
}

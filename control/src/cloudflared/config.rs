//! cloudflared tunnel configuration file
//!
//! Rendered shape:
//!
//! ```yaml
//! tunnel: 6ff42ae2-765d-4adf-8112-31c55c1551ef
//! credentials-file: /etc/cloudflared/creds.json
//! ingress:
//!   - hostname: web-default
//!     service: http://10.0.0.5:80
//!   - service: http_status:404
//! ```

use crate::error::ControllerError;
use common::IngressRecord;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Terminal rule cloudflared requires at the end of every ingress list
pub const CATCH_ALL_SERVICE: &str = "http_status:404";

/// Scheme of the origin services behind the tunnel
const ORIGIN_SCHEME: &str = "http://";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<String>,

    #[serde(
        rename = "credentials-file",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub credentials_file: Option<PathBuf>,

    #[serde(default)]
    pub ingress: Vec<IngressRule>,
}

/// One cloudflared ingress rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub service: String,
}

impl IngressRule {
    pub fn from_record(record: &IngressRecord) -> Self {
        Self {
            hostname: Some(record.hostname.clone()),
            service: format!("{}{}", ORIGIN_SCHEME, record.internal_address),
        }
    }

    pub fn catch_all() -> Self {
        Self {
            hostname: None,
            service: CATCH_ALL_SERVICE.to_string(),
        }
    }
}

impl TunnelConfig {
    /// Build a configuration with one rule per record, in order
    pub fn from_records(
        tunnel: Option<String>,
        credentials_file: Option<PathBuf>,
        records: &[IngressRecord],
    ) -> Self {
        let mut ingress: Vec<IngressRule> = records.iter().map(IngressRule::from_record).collect();
        if !ingress.is_empty() {
            ingress.push(IngressRule::catch_all());
        }

        Self {
            tunnel,
            credentials_file,
            ingress,
        }
    }

    pub fn render(&self) -> Result<String, ControllerError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ControllerError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Load a configuration file; a missing file is an empty configuration
    pub fn load(path: &Path) -> Result<Self, ControllerError> {
        match fs::read_to_string(path) {
            Ok(content) => Self::from_yaml(&content),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Public hostnames routed by this configuration
    pub fn hostnames(&self) -> Vec<&str> {
        self.ingress
            .iter()
            .filter_map(|rule| rule.hostname.as_deref())
            .collect()
    }
}

/// Atomically replace `path` with `content` unless it already holds it
///
/// Returns true if the file was written. The parent directory is created on
/// demand; the temporary file lives next to the target so the final rename
/// stays on one filesystem.
pub fn write_if_changed(path: &Path, content: &str) -> Result<bool, ControllerError> {
    match fs::read(path) {
        Ok(existing) if existing == content.as_bytes() => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".cflb")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;

    Ok(true)
}

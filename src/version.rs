// Running firmware version, persisted next to the images so it survives the
// restart into a new image.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ota::RestartRequest;
use crate::transport::{self, Storage};

pub const VERSION_FILE: &str = "version.json";

/// Version reported when nothing was ever committed
pub const NOT_INSTALLED: i64 = -1;

// Cargo package version of the agent itself
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub code_version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

pub fn load_record(storage: &dyn Storage, root: &Path) -> Result<Option<VersionRecord>> {
    let path = root.join(VERSION_FILE);
    if storage.file_len(&path)?.is_none() {
        return Ok(None);
    }
    let raw = transport::read_to_string(storage, &path).with_context(|| format!("reading {}", path.display()))?;
    let record = serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(record))
}

/// The committed CodeVersion, or [`NOT_INSTALLED`].
pub fn load_committed(storage: &dyn Storage, root: &Path) -> Result<i64> {
    let version = load_record(storage, root)?.map(|r| r.code_version).unwrap_or(NOT_INSTALLED);
    log::info!("Committed CodeVersion: {} (agent {})", version, AGENT_VERSION);
    Ok(version)
}

/// Record the image of `request` as the running version. Called by the
/// platform right before it restarts.
pub fn commit(storage: &mut dyn Storage, root: &Path, request: &RestartRequest) -> Result<()> {
    let record = VersionRecord {
        code_version: request.target_version,
        image: request
            .image_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string),
        sha256: Some(request.sha256.clone()),
    };
    let json = serde_json::to_vec(&record)?;
    let path = root.join(VERSION_FILE);
    transport::write_all(storage, &path, &json).with_context(|| format!("writing {}", path.display()))?;
    log::info!("Committed CodeVersion {}", record.code_version);
    Ok(())
}

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::logging;
use crate::ota::OtaPolicy;
use crate::transport::{Qos, TrustAnchor};
use crate::validators;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    // Provisioning
    pub provisioning_endpoint: String,
    pub id_scope: String,
    pub registration_id: String,
    /// Base64 symmetric key
    pub device_key: String,
    pub provisioning_timeout_secs: u64,

    // Trust anchors; `None` selects the platform bundle
    pub provisioning_ca_path: Option<String>,
    pub hub_ca_path: Option<String>,
    pub download_ca_path: Option<String>,

    // Session
    pub qos: Qos,
    pub snapshot_timeout_secs: u64,
    pub reconnect_backoff_secs: u64,
    pub reconnect_max_backoff_secs: u64,
    /// 0 retries forever
    pub max_reconnect_attempts: u32,

    // Firmware storage
    pub storage_root: String,
    pub firmware_extension: String,
    pub max_update_attempts: u32,

    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        // Provisioning credentials come from device_config.h via build.rs
        let registration_id = env!("AGENT_DPS_REGISTRATION_ID");
        let device_key = env!("AGENT_DPS_DEVICE_KEY");

        log::info!(
            "Config default: registration ID='{}', key={}",
            registration_id,
            if device_key.is_empty() { "<empty>" } else { "<set>" }
        );

        Self {
            provisioning_endpoint: env!("AGENT_DPS_ENDPOINT").to_string(),
            id_scope: env!("AGENT_DPS_ID_SCOPE").to_string(),
            registration_id: registration_id.to_string(),
            device_key: device_key.to_string(),
            provisioning_timeout_secs: 60,
            provisioning_ca_path: None,
            hub_ca_path: None,
            download_ca_path: None,
            qos: Qos::AtMostOnce,
            snapshot_timeout_secs: 10,
            reconnect_backoff_secs: 5,
            reconnect_max_backoff_secs: 300,
            max_reconnect_attempts: 0,
            storage_root: "/spiffs".to_string(),
            firmware_extension: "bin".to_string(),
            max_update_attempts: 3,
            log_level: "info".to_string(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.provisioning_endpoint.trim().is_empty() {
            bail!("Provisioning endpoint is empty");
        }
        validators::validate_id_scope(&self.id_scope)?;
        validators::validate_registration_id(&self.registration_id)?;
        if self.device_key.trim().is_empty() {
            bail!("Device key is empty");
        }
        if self.storage_root.is_empty() {
            bail!("Storage root is empty");
        }
        let ext = self.firmware_extension.trim_start_matches('.');
        if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
            bail!("Firmware extension '{}' is not valid", self.firmware_extension);
        }
        if self.max_update_attempts == 0 {
            bail!("max_update_attempts must be at least 1");
        }
        if logging::parse_level(&self.log_level).is_none() {
            bail!("Unknown log level '{}'", self.log_level);
        }
        Ok(())
    }

    pub fn provisioning_deadline(&self) -> Duration {
        Duration::from_secs(self.provisioning_timeout_secs)
    }

    pub fn snapshot_deadline(&self) -> Duration {
        Duration::from_secs(self.snapshot_timeout_secs)
    }

    pub fn ota_policy(&self) -> OtaPolicy {
        OtaPolicy {
            max_attempts_per_target: self.max_update_attempts,
        }
    }

    pub fn provisioning_trust_anchor(&self) -> Result<TrustAnchor> {
        load_trust_anchor(self.provisioning_ca_path.as_deref())
    }

    pub fn hub_trust_anchor(&self) -> Result<TrustAnchor> {
        load_trust_anchor(self.hub_ca_path.as_deref())
    }

    pub fn download_trust_anchor(&self) -> Result<TrustAnchor> {
        load_trust_anchor(self.download_ca_path.as_deref())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec(self)?;
        fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        log::info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

fn load_trust_anchor(path: Option<&str>) -> Result<TrustAnchor> {
    let Some(path) = path else {
        return Ok(TrustAnchor::PlatformBundle);
    };
    let pem = fs::read_to_string(path).with_context(|| format!("reading certificate {}", path))?;
    if !pem.contains("-----BEGIN CERTIFICATE-----") {
        bail!("{} does not contain a PEM certificate", path);
    }
    Ok(TrustAnchor::pem(pem))
}

/// Load a JSON override from `path`, or fall back to the compiled defaults.
/// A file that parses but does not validate is an error.
pub fn load_or_default(path: &Path) -> Result<AgentConfig> {
    let config = read_or_default(path);
    config.validate()?;
    Ok(config)
}

fn read_or_default(path: &Path) -> AgentConfig {
    match fs::read(path) {
        Ok(bytes) => match serde_json::from_slice::<AgentConfig>(&bytes) {
            Ok(config) => {
                log::info!("Loaded configuration from {}", path.display());
                config
            }
            Err(e) => {
                log::warn!("Failed to parse {}: {}, using defaults", path.display(), e);
                AgentConfig::default()
            }
        },
        Err(e) => {
            log::warn!("Failed to read {}: {}, using defaults", path.display(), e);
            AgentConfig::default()
        }
    }
}

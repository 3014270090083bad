// ESP-IDF adapters: HTTPS download, NVS-backed configuration and restart.

use std::io;
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use embedded_svc::http::client::Connection;
use embedded_svc::http::Method;
use esp_idf_svc::http::client::{Configuration, EspHttpConnection};
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs};
use esp_idf_svc::tls::X509;

use crate::agent::Agent;
use crate::config::AgentConfig;
use crate::logging;
use crate::storage::FsStorage;
use crate::transport::{
    CloudTransport, HttpResponse, HttpTransport, ProvisioningTransport, SessionEvent, TrustAnchor,
};

const CONFIG_NAMESPACE: &str = "ota_agent";
const CONFIG_KEY: &str = "config";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// One TLS connection per download, built from the trust anchor of the call.
#[derive(Default)]
pub struct EspHttpTransport {
    connection: Option<EspHttpConnection>,
    // NUL-terminated PEM; the TLS layer needs it for the program lifetime
    pinned: Option<(Arc<str>, &'static [u8])>,
}

impl EspHttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn configuration(&mut self, trust_anchor: &TrustAnchor) -> Configuration {
        match trust_anchor {
            TrustAnchor::PlatformBundle => Configuration {
                crt_bundle_attach: Some(esp_idf_sys::esp_crt_bundle_attach),
                timeout: Some(HTTP_TIMEOUT),
                ..Default::default()
            },
            TrustAnchor::Pem(pem) => {
                let stale = self.pinned.as_ref().map(|(p, _)| p != pem).unwrap_or(true);
                if stale {
                    let mut bytes = pem.as_bytes().to_vec();
                    bytes.push(0);
                    let leaked: &'static [u8] = Box::leak(bytes.into_boxed_slice());
                    self.pinned = Some((pem.clone(), leaked));
                }
                let cert = self.pinned.as_ref().map(|(_, bytes)| X509::pem_until_nul(*bytes));
                Configuration {
                    server_certificate: cert,
                    timeout: Some(HTTP_TIMEOUT),
                    ..Default::default()
                }
            }
        }
    }
}

struct EspBody<'a> {
    connection: &'a mut EspHttpConnection,
}

impl io::Read for EspBody<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        embedded_svc::io::Read::read(self.connection, buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("{:?}", e)))
    }
}

fn to_io(e: esp_idf_sys::EspError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("{:?}", e))
}

impl HttpTransport for EspHttpTransport {
    fn get<'a>(&'a mut self, url: &str, trust_anchor: &TrustAnchor) -> io::Result<HttpResponse<'a>> {
        let config = self.configuration(trust_anchor);
        let mut connection = EspHttpConnection::new(&config).map_err(to_io)?;
        connection.initiate_request(Method::Get, url, &[]).map_err(to_io)?;
        connection.initiate_response().map_err(to_io)?;
        let status = connection.status();

        let connection = self.connection.insert(connection);
        Ok(HttpResponse {
            status,
            body: Box::new(EspBody { connection }),
        })
    }
}

/// Device entry point. Runs the agent until an image is verified, commits its
/// version and reboots into it. `events` is fed by `cloud`.
pub fn run_agent<P, C>(provisioning: P, cloud: C, events: Receiver<SessionEvent>) -> Result<()>
where
    P: ProvisioningTransport,
    C: CloudTransport,
{
    esp_idf_sys::link_patches();
    logging::init_logger().map_err(|e| anyhow::anyhow!("{}", e))?;

    let config = load_config_or_default()?;
    let storage = FsStorage::new();
    storage.ensure_root(Path::new(&config.storage_root))?;

    let mut agent = Agent::from_config(&config, provisioning, cloud, EspHttpTransport::new(), storage, events)?;
    agent.start()?;
    let request = agent.run()?;
    agent.commit_restart(&request)?;
    restart()
}

/// Hand control to the bootloader.
pub fn restart() -> ! {
    log::warn!("Restarting into the new image");
    unsafe { esp_idf_sys::esp_restart() }
}

pub fn load_config_from_nvs() -> Result<AgentConfig> {
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs = EspNvs::new(nvs_partition, CONFIG_NAMESPACE, true)?;

    let mut buf = vec![0u8; 2048];
    let data = nvs
        .get_blob(CONFIG_KEY, &mut buf)?
        .ok_or_else(|| anyhow::anyhow!("Config not found in NVS"))?;

    let config: AgentConfig = serde_json::from_slice(data)?;
    config.validate()?;
    Ok(config)
}

pub fn save_config_to_nvs(config: &AgentConfig) -> Result<()> {
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let mut nvs = EspNvs::new(nvs_partition, CONFIG_NAMESPACE, false)?;

    let json = serde_json::to_vec(config)?;
    nvs.set_blob(CONFIG_KEY, &json)?;
    log::info!("Configuration saved to NVS");
    Ok(())
}

/// NVS first, compiled defaults otherwise
pub fn load_config_or_default() -> Result<AgentConfig> {
    match load_config_from_nvs() {
        Ok(config) => {
            log::info!("Loaded configuration from NVS");
            Ok(config)
        }
        Err(e) => {
            log::warn!("Failed to load config from NVS: {:?}, using defaults", e);
            let config = AgentConfig::default();
            config.validate()?;
            if let Err(save_err) = save_config_to_nvs(&config) {
                log::warn!("Failed to save default config to NVS: {:?}", save_err);
            }
            Ok(config)
        }
    }
}

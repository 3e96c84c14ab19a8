use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Error};
use rustls_native_certs::load_native_certs;
use rustls_pemfile::{certs, private_key};
use serde::{Deserialize, Deserializer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};

use palaver_core::xmpp::jid::Jid;
use palaver_inbound::sasl::Mechanism;
use palaver_inbound::InboundConfig;
use palaver_services::registry::ConflictPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub port: u16,
    #[serde(deserialize_with = "deserialize_jid")]
    pub domain: Jid,
    #[serde(default, deserialize_with = "deserialize_jids")]
    pub virtual_hosts: Vec<Jid>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceConflict {
    Suffix,
    Kick,
}

impl From<ResourceConflict> for ConflictPolicy {
    fn from(conflict: ResourceConflict) -> Self {
        match conflict {
            ResourceConflict::Suffix => ConflictPolicy::Suffix,
            ResourceConflict::Kick => ConflictPolicy::Kick,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSettings {
    pub max_connections: usize,
    pub idle_timeout_secs: u64,
    pub max_connections_per_ip: usize,
    pub max_stanza_bytes: usize,
    pub queue_size: usize,
    pub resource_conflict: ResourceConflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientAuth {
    None,
    Want,
    Need,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsSettings {
    pub enabled: bool,
    pub required: bool,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub client_auth: ClientAuth,
}

impl TlsSettings {
    /// Loads the PEM material and builds the rustls server configuration.
    /// Returns `None` when TLS is disabled.
    pub fn server_config(&self) -> Result<Option<Arc<ServerConfig>>, Error> {
        if !self.enabled {
            return Ok(None);
        }
        let (Some(cert_file), Some(key_file)) = (&self.cert_file, &self.key_file) else {
            bail!("tls.enabled requires tls.cert_file and tls.key_file");
        };

        let cert_chain = certs(&mut BufReader::new(File::open(cert_file)?))
            .collect::<Result<Vec<_>, _>>()?;
        let key = private_key(&mut BufReader::new(File::open(key_file)?))?
            .ok_or_else(|| anyhow!("no private key found in {key_file}"))?;

        let builder = match self.client_auth {
            ClientAuth::None => ServerConfig::builder().with_no_client_auth(),
            ClientAuth::Want | ClientAuth::Need => {
                let mut root_cert_store = RootCertStore::empty();
                for cert in load_native_certs()? {
                    root_cert_store.add(cert)?;
                }
                let verifier_builder = WebPkiClientVerifier::builder(Arc::new(root_cert_store));
                let verifier = if self.client_auth == ClientAuth::Want {
                    verifier_builder.allow_unauthenticated().build()?
                } else {
                    verifier_builder.build()?
                };
                ServerConfig::builder().with_client_cert_verifier(verifier)
            }
        };

        let config = builder.with_single_cert(cert_chain, key)?;
        Ok(Some(Arc::new(config)))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SaslSettings {
    pub mechanisms: Vec<String>,
    pub max_attempts: u32,
    pub timeout_secs: u64,
}

impl SaslSettings {
    pub fn mechanism_list(&self) -> Result<Vec<Mechanism>, Error> {
        self.mechanisms
            .iter()
            .map(|name| Mechanism::try_from(name.as_str()))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub connection: ConnectionSettings,
    pub tls: TlsSettings,
    pub sasl: SaslSettings,
}

impl Settings {
    /// Layers built-in defaults, `config/defaults`, `config/overrides` and
    /// `PALAVER__`-prefixed environment variables.
    pub fn init() -> Result<Self, Error> {
        let settings = config::Config::builder()
            .set_default("server.port", 5222)?
            .set_default("server.domain", "localhost")?
            .set_default("connection.max_connections", 10000)?
            .set_default("connection.idle_timeout_secs", 1800)?
            .set_default("connection.max_connections_per_ip", 10)?
            .set_default("connection.max_stanza_bytes", 65536)?
            .set_default("connection.queue_size", 1000)?
            .set_default("connection.resource_conflict", "suffix")?
            .set_default("tls.enabled", true)?
            .set_default("tls.required", true)?
            .set_default("tls.client_auth", "none")?
            .set_default(
                "sasl.mechanisms",
                vec!["PLAIN", "SCRAM-SHA-1", "SCRAM-SHA-256"],
            )?
            .set_default("sasl.max_attempts", 3)?
            .set_default("sasl.timeout_secs", 30)?
            .add_source(config::File::with_name("config/defaults").required(false))
            .add_source(config::File::with_name("config/overrides").required(false))
            .add_source(config::Environment::with_prefix("PALAVER").separator("__"))
            .build()?;

        settings.try_deserialize().map_err(|e| anyhow!(e))
    }

    pub fn inbound_config(&self) -> Result<InboundConfig, Error> {
        Ok(InboundConfig {
            domain: self.server.domain.clone(),
            tls_enabled: self.tls.enabled,
            tls_required: self.tls.enabled && self.tls.required,
            max_stanza_bytes: self.connection.max_stanza_bytes,
            queue_size: self.connection.queue_size,
            idle_timeout: Duration::from_secs(self.connection.idle_timeout_secs),
            sasl_mechanisms: self.sasl.mechanism_list()?,
            sasl_max_attempts: self.sasl.max_attempts,
            sasl_timeout: Duration::from_secs(self.sasl.timeout_secs),
        })
    }

    pub fn conflict_policy(&self) -> ConflictPolicy {
        self.connection.resource_conflict.into()
    }
}

fn deserialize_jid<'d, D: Deserializer<'d>>(deserializer: D) -> Result<Jid, D::Error> {
    let raw_jid = String::deserialize(deserializer)?;
    raw_jid.parse::<Jid>().map_err(serde::de::Error::custom)
}

fn deserialize_jids<'d, D: Deserializer<'d>>(deserializer: D) -> Result<Vec<Jid>, D::Error> {
    let raw_jids = Vec::<String>::deserialize(deserializer)?;
    raw_jids
        .iter()
        .map(|raw| raw.parse::<Jid>().map_err(serde::de::Error::custom))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_section() {
        let settings = Settings::init().unwrap();
        assert_eq!(settings.server.port, 5222);
        assert_eq!(settings.server.domain.to_string(), "localhost");
        assert!(settings.server.virtual_hosts.is_empty());
        assert_eq!(settings.connection.max_connections, 10000);
        assert_eq!(settings.connection.idle_timeout_secs, 1800);
        assert_eq!(settings.connection.max_stanza_bytes, 65536);
        assert!(settings.tls.enabled);
        assert!(settings.tls.required);
        assert_eq!(settings.tls.client_auth, ClientAuth::None);
        assert_eq!(settings.sasl.max_attempts, 3);
        assert_eq!(settings.sasl.mechanism_list().unwrap().len(), 3);
    }

    #[test]
    fn inbound_config_mirrors_settings() {
        let settings = Settings::init().unwrap();
        let inbound = settings.inbound_config().unwrap();
        assert_eq!(inbound.domain.to_string(), "localhost");
        assert_eq!(inbound.max_stanza_bytes, 65536);
        assert_eq!(inbound.idle_timeout, Duration::from_secs(1800));
        assert_eq!(inbound.sasl_timeout, Duration::from_secs(30));
        assert!(inbound.tls_required);
    }

    #[test]
    fn disabled_tls_yields_no_server_config() {
        let tls = TlsSettings {
            enabled: false,
            required: false,
            cert_file: None,
            key_file: None,
            client_auth: ClientAuth::None,
        };
        assert!(tls.server_config().unwrap().is_none());
    }

    #[test]
    fn enabled_tls_without_material_is_an_error() {
        let tls = TlsSettings {
            enabled: true,
            required: true,
            cert_file: None,
            key_file: None,
            client_auth: ClientAuth::None,
        };
        assert!(tls.server_config().is_err());
    }
}

use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

use crate::model::Endpoint;
use crate::net;

/// Coordination store backend used for registration.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// etcd v3 cluster
    #[default]
    Etcd,
    /// In-process store, useful for local runs and tests
    Memory,
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StoreBackend::Etcd => "etcd",
            StoreBackend::Memory => "memory",
        };
        write!(f, "{s}")
    }
}

/// Connection settings for the coordination store
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Client endpoints, e.g. `127.0.0.1:2379`
    pub endpoints: Vec<String>,
    /// Maximum time to establish the initial connection
    #[serde(with = "humantime_serde")]
    pub dial_timeout: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Etcd,
            endpoints: vec![String::from("127.0.0.1:2379")],
            dial_timeout: Duration::from_secs(5),
            username: None,
            password: None,
        }
    }
}

/// What gets registered and how the lease is kept
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistrationConfig {
    /// Key prefix all services are registered under
    pub base_path: String,
    /// Logical service name; `/` is replaced with `-` in keys
    pub service_name: String,
    /// Port advertised for this instance
    pub service_port: u16,
    /// Address advertised for this instance; detected when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default)]
    pub metadata: Vec<String>,
    /// Lease time-to-live
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Upper bound for each individual store call
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
    /// Revoke the granted lease when publishing the endpoint fails
    pub revoke_on_publish_failure: bool,
    /// Start a new registration cycle when the lease is lost
    pub reregister_on_loss: bool,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            base_path: String::from("/discovery"),
            service_name: String::new(),
            service_port: 18080,
            advertise_address: None,
            locality: None,
            stage: None,
            metadata: Vec::new(),
            ttl: Duration::from_secs(5),
            default_timeout: Duration::from_secs(10),
            revoke_on_publish_failure: false,
            reregister_on_loss: false,
        }
    }
}

impl RegistrationConfig {
    /// Endpoint advertised for this instance.
    ///
    /// Uses `advertise_address` when set, otherwise the host's outbound address.
    pub fn endpoint(&self) -> io::Result<Endpoint> {
        let address = match &self.advertise_address {
            Some(address) => address.clone(),
            None => net::local_ip()?.to_string(),
        };

        let mut endpoint =
            Endpoint::new(address, self.service_port).with_metadata(self.metadata.iter().cloned());
        if let Some(locality) = &self.locality {
            endpoint = endpoint.with_locality(locality.clone());
        }
        if let Some(stage) = &self.stage {
            endpoint = endpoint.with_stage(stage.clone());
        }
        Ok(endpoint)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Configuration {
    /// Coordination store connection
    pub store: StoreConfig,
    /// Service registration
    pub registration: RegistrationConfig,
    /// Log output
    pub logging: LoggingConfig,
}

impl Configuration {
    /// Load from defaults, `memento.toml` and `MEMENTO__` environment variables.
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::figment(Toml::file("memento.toml"))
            .extract()
            .map_err(Box::new)
    }

    /// Load from defaults, the given TOML file and `MEMENTO__` environment variables.
    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        Self::figment(Toml::file_exact(path))
            .extract()
            .map_err(Box::new)
    }

    fn figment(file: figment::providers::Data<Toml>) -> Figment {
        Figment::from(Serialized::defaults(Configuration::default()))
            .merge(file)
            .merge(Env::prefixed("MEMENTO__").split("__"))
    }
}

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{GatewayError, Result};

/// A resolved service endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Lookup interface for `@service-name` endpoints.
///
/// Only the query side of the discovery agent is consumed; registration and
/// health checking live elsewhere.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Resolve a service name to one or more `host:port` endpoints.
    async fn lookup(&self, name: &str) -> Result<Vec<HostPort>>;
}

/// Discovery backed by a Consul agent's catalog API.
pub struct ConsulCatalog {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ConsulServiceEntry {
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "ServiceAddress")]
    service_address: Option<String>,
    #[serde(rename = "ServicePort")]
    service_port: u16,
}

impl ConsulCatalog {
    /// `agent` is the `host:port` of the Consul HTTP API.
    pub fn new(agent: &str) -> ConsulCatalog {
        ConsulCatalog {
            base_url: format!("http://{agent}"),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Discovery for ConsulCatalog {
    async fn lookup(&self, name: &str) -> Result<Vec<HostPort>> {
        let url = format!("{}/v1/catalog/service/{name}", self.base_url);
        let entries: Vec<ConsulServiceEntry> = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| GatewayError::Resolution(format!("consul query failed: {e}")))?
            .error_for_status()
            .map_err(|e| GatewayError::Resolution(format!("consul query failed: {e}")))?
            .json()
            .await
            .map_err(|e| GatewayError::Resolution(format!("consul response unreadable: {e}")))?;

        if entries.is_empty() {
            return Err(GatewayError::Resolution(format!(
                "service '{name}' has no registered endpoints"
            )));
        }

        Ok(entries
            .into_iter()
            .map(|entry| {
                let host = match entry.service_address {
                    Some(addr) if !addr.is_empty() => addr,
                    _ => entry.address,
                };
                HostPort {
                    host,
                    port: entry.service_port,
                }
            })
            .collect())
    }
}

/// Fixed-table discovery, used by tests and static deployments.
#[derive(Default)]
pub struct StaticDiscovery {
    entries: HashMap<String, Vec<HostPort>>,
}

impl StaticDiscovery {
    pub fn new() -> StaticDiscovery {
        StaticDiscovery::default()
    }

    pub fn with_service(mut self, name: &str, endpoints: Vec<HostPort>) -> StaticDiscovery {
        self.entries.insert(name.to_string(), endpoints);
        self
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn lookup(&self, name: &str) -> Result<Vec<HostPort>> {
        self.entries.get(name).cloned().ok_or_else(|| {
            GatewayError::Resolution(format!("service '{name}' is not registered"))
        })
    }
}

//! Consul HTTP API client
//!
//! A pure client of the agent's HTTP API: member list, leader status, and
//! KV get/put. Nothing here retries; polling lives in the probe.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
#[cfg(test)]
use mockall::automock;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::{Error, Result};

/// One entry of `/v1/agent/members`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentMember {
    pub name: String,
    #[serde(default)]
    pub addr: String,
    #[serde(default)]
    pub status: i64,
}

/// Operations against a single Consul agent
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Members as seen by this agent's gossip pool
    async fn members(&self) -> Result<Vec<AgentMember>>;

    /// Raft leader address, empty while no leader is elected
    async fn leader(&self) -> Result<String>;

    async fn kv_put(&self, key: &str, value: &str) -> Result<()>;

    /// `None` when the key does not exist
    async fn kv_get(&self, key: &str) -> Result<Option<String>>;
}

/// Opens a [`ClusterApi`] against a node address
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Box<dyn ClusterApi>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvEntry {
    #[serde(default)]
    value: Option<String>,
}

/// [`ClusterApi`] over HTTP
#[derive(Debug, Clone)]
pub struct ConsulClient {
    http: reqwest::Client,
    base_url: String,
}

impl ConsulClient {
    /// Client for `base_url`, e.g. `http://10.0.0.2:8500`
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn api_error(&self, message: impl Into<String>) -> Error {
        Error::consul_api(&self.base_url, message)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| self.api_error(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.api_error(format!("GET {} returned {}: {}", path, status, body)));
        }
        response
            .json()
            .await
            .map_err(|e| self.api_error(format!("GET {}: {}", path, e)))
    }
}

#[async_trait]
impl ClusterApi for ConsulClient {
    async fn members(&self) -> Result<Vec<AgentMember>> {
        let members: Vec<AgentMember> = self.get_json("/v1/agent/members").await?;
        debug!(consul = %self.base_url, count = members.len(), "Read agent members");
        Ok(members)
    }

    async fn leader(&self) -> Result<String> {
        let leader: String = self.get_json("/v1/status/leader").await?;
        debug!(consul = %self.base_url, leader = %leader, "Read leader");
        Ok(leader)
    }

    async fn kv_put(&self, key: &str, value: &str) -> Result<()> {
        let path = format!("/v1/kv/{}", key);
        let response = self
            .http
            .put(self.url(&path))
            .body(value.to_string())
            .send()
            .await
            .map_err(|e| self.api_error(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.api_error(format!("PUT {} returned {}: {}", path, status, body)));
        }
        let accepted: bool = response
            .json()
            .await
            .map_err(|e| self.api_error(format!("PUT {}: {}", path, e)))?;
        if !accepted {
            return Err(self.api_error(format!("PUT {} was not accepted", path)));
        }
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let path = format!("/v1/kv/{}", key);
        let response = self
            .http
            .get(self.url(&path))
            .send()
            .await
            .map_err(|e| self.api_error(e.to_string()))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.api_error(format!("GET {} returned {}: {}", path, status, body)));
        }
        let entries: Vec<KvEntry> = response
            .json()
            .await
            .map_err(|e| self.api_error(format!("GET {}: {}", path, e)))?;
        let Some(entry) = entries.into_iter().next() else {
            return Ok(None);
        };
        decode_value(entry.value.as_deref())
            .map(Some)
            .map_err(|message| self.api_error(format!("key {}: {}", key, message)))
    }
}

/// Decode a KV `Value` field. A null value is an empty string.
fn decode_value(encoded: Option<&str>) -> std::result::Result<String, String> {
    let Some(encoded) = encoded else {
        return Ok(String::new());
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| format!("value is not valid base64: {}", e))?;
    String::from_utf8(bytes).map_err(|e| format!("value is not utf-8: {}", e))
}

/// [`ClusterConnector`] that builds a [`ConsulClient`] for `http://<address>:<port>`
#[derive(Debug, Clone)]
pub struct ConsulConnector {
    port: u16,
    request_timeout: Duration,
}

impl ConsulConnector {
    pub fn new(port: u16, request_timeout: Duration) -> Self {
        Self {
            port,
            request_timeout,
        }
    }

    pub fn base_url(&self, address: &str) -> String {
        format!("http://{}:{}", address, self.port)
    }
}

#[async_trait]
impl ClusterConnector for ConsulConnector {
    async fn connect(&self, address: &str) -> Result<Box<dyn ClusterApi>> {
        let client = ConsulClient::new(self.base_url(address), self.request_timeout)?;
        Ok(Box::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_targets_the_http_port() {
        let connector = ConsulConnector::new(8500, Duration::from_secs(10));
        assert_eq!(connector.base_url("34.1.2.3"), "http://34.1.2.3:8500");
    }

    #[test]
    fn trailing_slash_is_dropped_from_the_base_url() {
        let client = ConsulClient::new("http://127.0.0.1:8500/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:8500");
        assert_eq!(client.url("/v1/status/leader"), "http://127.0.0.1:8500/v1/status/leader");
    }

    #[test]
    fn kv_values_are_base64_decoded() {
        assert_eq!(decode_value(Some("YmFy")).unwrap(), "bar");
        assert_eq!(decode_value(None).unwrap(), "");
        assert!(decode_value(Some("not base64!")).is_err());
    }

    #[test]
    fn members_are_parsed_from_agent_json() {
        let json = r#"[
            {"Name": "consul-server-1", "Addr": "10.0.0.2", "Port": 8301, "Status": 1, "Tags": {"role": "consul"}},
            {"Name": "consul-client-1", "Addr": "10.0.0.3", "Port": 8301, "Status": 1}
        ]"#;
        let members: Vec<AgentMember> = serde_json::from_str(json).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].name, "consul-server-1");
        assert_eq!(members[1].addr, "10.0.0.3");
    }
}

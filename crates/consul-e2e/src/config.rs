//! Harness configuration
//!
//! Variable names of the Terraform and Packer templates live here as
//! constants. Everything that varies per run is collected into one
//! [`HarnessConfig`], built once at startup and passed by reference to every
//! component, so concurrent runs never share mutable settings.

use std::path::PathBuf;
use std::time::Duration;

use harness_common::PollPolicy;

use crate::{Error, Result};

// =============================================================================
// Terraform template contract
// =============================================================================

pub const VAR_PROJECT: &str = "gcp_project_id";
pub const VAR_REGION: &str = "gcp_region";

pub const VAR_SERVER_CLUSTER_NAME: &str = "consul_server_cluster_name";
pub const VAR_CLIENT_CLUSTER_NAME: &str = "consul_client_cluster_name";

pub const VAR_SERVER_CLUSTER_TAG_NAME: &str = "consul_server_cluster_tag_name";
pub const VAR_CLIENT_CLUSTER_TAG_NAME: &str = "consul_client_cluster_tag_name";

pub const VAR_SERVER_SOURCE_IMAGE: &str = "consul_server_source_image";
pub const VAR_CLIENT_SOURCE_IMAGE: &str = "consul_client_source_image";

pub const VAR_SERVER_CLUSTER_SIZE: &str = "consul_server_cluster_size";
pub const VAR_CLIENT_CLUSTER_SIZE: &str = "consul_client_cluster_size";

pub const VAR_SERVER_ALLOWED_CIDR_HTTP_API: &str =
    "consul_server_allowed_inbound_cidr_blocks_http_api";
pub const VAR_SERVER_ALLOWED_CIDR_DNS: &str = "consul_server_allowed_inbound_cidr_blocks_dns";
pub const VAR_CLIENT_ALLOWED_CIDR_HTTP_API: &str =
    "consul_client_allowed_inbound_cidr_blocks_http_api";
pub const VAR_CLIENT_ALLOWED_CIDR_DNS: &str = "consul_client_allowed_inbound_cidr_blocks_dns";

/// Output holding the server managed instance group name
pub const OUTPUT_SERVER_INSTANCE_GROUP: &str = "instance_group_name";
/// Output holding the client managed instance group name
pub const OUTPUT_CLIENT_INSTANCE_GROUP: &str = "client_instance_group_name";

// =============================================================================
// Packer template contract
// =============================================================================

pub const PACKER_VAR_PROJECT_ID: &str = "project_id";
pub const PACKER_VAR_ZONE: &str = "zone";

// =============================================================================
// Defaults
// =============================================================================

pub const DEFAULT_NUM_SERVERS: u32 = 3;
pub const DEFAULT_NUM_CLIENTS: u32 = 4;

/// Consul's HTTP API port
pub const DEFAULT_CONSUL_HTTP_PORT: u16 = 8500;

pub const DEFAULT_PACKER_BUILD_NAME: &str = "googlecompute";
pub const DEFAULT_PACKER_TEMPLATE: &str = "examples/consul-image/consul.json";
pub const DEFAULT_KEY_PREFIX: &str = "consul-e2e";

/// Env vars checked (in order) for the GCP project id
pub const PROJECT_ENV_VARS: &[&str] = &[
    "GOOGLE_CLOUD_PROJECT",
    "GOOGLE_PROJECT",
    "GCLOUD_PROJECT",
    "CLOUDSDK_CORE_PROJECT",
];

/// Immutable settings for one harness run
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// GCP project all resources are created in
    pub project_id: String,
    /// Root of the Terraform example that gets deployed
    pub template_dir: PathBuf,
    /// Packer template for the Consul image
    pub packer_template: PathBuf,
    /// Packer `-only` build name
    pub packer_build_name: String,
    /// Explicit working directory, bypassing the temp copy
    pub work_dir: Option<PathBuf>,
    pub num_servers: u32,
    pub num_clients: u32,
    /// Inbound CIDR allowlist used for all four HTTP-API/DNS rules
    pub allowed_inbound_cidrs: Vec<String>,
    pub consul_port: u16,
    /// Regions to pick from; empty means any region that is UP
    pub approved_regions: Vec<String>,
    pub forbidden_regions: Vec<String>,
    /// How long to wait for an instance group to get a member
    pub boot_policy: PollPolicy,
    /// How long to wait for membership and leader election
    pub health_policy: PollPolicy,
    /// Timeout for each Consul HTTP request
    pub request_timeout: Duration,
    /// Timeout for short gcloud calls
    pub cloud_command_timeout: Duration,
    pub key_prefix: String,
}

impl HarnessConfig {
    /// Config with defaults for everything but the project and paths
    pub fn new(project_id: impl Into<String>, template_dir: impl Into<PathBuf>) -> Self {
        let template_dir = template_dir.into();
        Self {
            project_id: project_id.into(),
            packer_template: template_dir.join(DEFAULT_PACKER_TEMPLATE),
            template_dir,
            packer_build_name: DEFAULT_PACKER_BUILD_NAME.to_string(),
            work_dir: None,
            num_servers: DEFAULT_NUM_SERVERS,
            num_clients: DEFAULT_NUM_CLIENTS,
            allowed_inbound_cidrs: vec!["0.0.0.0/0".to_string()],
            consul_port: DEFAULT_CONSUL_HTTP_PORT,
            approved_regions: Vec::new(),
            forbidden_regions: Vec::new(),
            boot_policy: PollPolicy::INSTANCE_BOOT,
            health_policy: PollPolicy::CLUSTER_HEALTH,
            request_timeout: Duration::from_secs(10),
            cloud_command_timeout: Duration::from_secs(120),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    /// Total Consul agents a healthy cluster reports as members.
    pub fn expected_members(&self) -> usize {
        (self.num_servers + self.num_clients) as usize
    }

    /// Reject settings that cannot produce a meaningful run.
    pub fn validate(&self) -> Result<()> {
        if self.project_id.trim().is_empty() {
            return Err(Error::config("GCP project id is empty"));
        }
        if self.num_servers == 0 {
            return Err(Error::config("at least one consul server is required"));
        }
        if self.packer_build_name.trim().is_empty() {
            return Err(Error::config("packer build name is empty"));
        }
        if self.allowed_inbound_cidrs.is_empty() {
            return Err(Error::config("inbound CIDR allowlist is empty"));
        }
        Ok(())
    }
}

/// Read the GCP project id from the first non-empty of [`PROJECT_ENV_VARS`].
pub fn project_id_from_env() -> Result<String> {
    project_id_from(|name| std::env::var(name).ok())
}

fn project_id_from(lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
    PROJECT_ENV_VARS
        .iter()
        .filter_map(|name| lookup(name))
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .ok_or_else(|| {
            Error::config(format!(
                "GCP project id not set; export one of {}",
                PROJECT_ENV_VARS.join(", ")
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_expect_three_servers_and_four_clients() {
        let config = HarnessConfig::new("my-project", "/repo");
        assert_eq!(config.expected_members(), 7);
        assert_eq!(config.consul_port, 8500);
        assert_eq!(
            config.packer_template,
            PathBuf::from("/repo/examples/consul-image/consul.json")
        );
        assert_eq!(config.boot_policy, PollPolicy::INSTANCE_BOOT);
        assert_eq!(config.health_policy, PollPolicy::CLUSTER_HEALTH);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_project_is_rejected() {
        let config = HarnessConfig::new("  ", "/repo");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("project"));
    }

    #[test]
    fn serverless_cluster_is_rejected() {
        let mut config = HarnessConfig::new("p", "/repo");
        config.num_servers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn project_lookup_takes_first_non_empty_variable() {
        let env: HashMap<&str, &str> =
            HashMap::from([("GOOGLE_PROJECT", ""), ("GCLOUD_PROJECT", "from-gcloud")]);
        let project = project_id_from(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(project, "from-gcloud");
    }

    #[test]
    fn missing_project_lists_the_variables_to_set() {
        let err = project_id_from(|_| None).unwrap_err();
        assert!(err.to_string().contains("GOOGLE_CLOUD_PROJECT"));
    }
}

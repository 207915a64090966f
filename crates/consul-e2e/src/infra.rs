//! Infrastructure deploy adapter
//!
//! Applies and destroys the Terraform example. The variable map is kept in
//! [`DeployOptions`] and persisted between stages, so `validate` and
//! `teardown` can run in a later process than `deploy`. Re-applying with only
//! the source image variables changed is how the rolling redeploy happens.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use harness_common::{run_cmd, CommandSpec};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{self, HarnessConfig};
use crate::{Error, Result};

/// File the variable map is written to before each terraform call
pub const TFVARS_FILE_NAME: &str = "consul-e2e.tfvars.json";

/// A Terraform variable value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TfVar {
    Int(i64),
    Str(String),
    List(Vec<String>),
}

impl From<&str> for TfVar {
    fn from(v: &str) -> Self {
        TfVar::Str(v.to_string())
    }
}

impl From<String> for TfVar {
    fn from(v: String) -> Self {
        TfVar::Str(v)
    }
}

impl From<u32> for TfVar {
    fn from(v: u32) -> Self {
        TfVar::Int(v.into())
    }
}

impl From<Vec<String>> for TfVar {
    fn from(v: Vec<String>) -> Self {
        TfVar::List(v)
    }
}

/// Names for one deployment of the server and client groups
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNames {
    pub server: String,
    pub client: String,
}

impl ClusterNames {
    /// Names namespaced by a per-run unique id
    pub fn for_run(unique_id: &str) -> Self {
        Self {
            server: format!("consul-server-cluster-{}", unique_id),
            client: format!("consul-client-cluster-{}", unique_id),
        }
    }
}

/// Terraform working directory plus the variables to apply it with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployOptions {
    pub terraform_dir: PathBuf,
    pub vars: BTreeMap<String, TfVar>,
}

impl DeployOptions {
    /// The full variable contract of the consul cluster example, deployed
    /// into `project` (the one its region and image were resolved in)
    pub fn for_cluster(
        config: &HarnessConfig,
        terraform_dir: &Path,
        project: &str,
        region: &str,
        names: &ClusterNames,
        image_id: &str,
    ) -> Self {
        let cidrs = config.allowed_inbound_cidrs.clone();
        let vars: BTreeMap<String, TfVar> = [
            (config::VAR_PROJECT, TfVar::from(project)),
            (config::VAR_REGION, region.into()),
            (config::VAR_SERVER_CLUSTER_NAME, names.server.as_str().into()),
            (config::VAR_CLIENT_CLUSTER_NAME, names.client.as_str().into()),
            (config::VAR_SERVER_CLUSTER_TAG_NAME, names.server.as_str().into()),
            (config::VAR_CLIENT_CLUSTER_TAG_NAME, names.client.as_str().into()),
            (config::VAR_SERVER_SOURCE_IMAGE, image_id.into()),
            (config::VAR_CLIENT_SOURCE_IMAGE, image_id.into()),
            (config::VAR_SERVER_CLUSTER_SIZE, config.num_servers.into()),
            (config::VAR_CLIENT_CLUSTER_SIZE, config.num_clients.into()),
            (config::VAR_SERVER_ALLOWED_CIDR_HTTP_API, cidrs.clone().into()),
            (config::VAR_SERVER_ALLOWED_CIDR_DNS, cidrs.clone().into()),
            (config::VAR_CLIENT_ALLOWED_CIDR_HTTP_API, cidrs.clone().into()),
            (config::VAR_CLIENT_ALLOWED_CIDR_DNS, cidrs.into()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            terraform_dir: terraform_dir.to_path_buf(),
            vars,
        }
    }

    /// Point both node groups at new source images.
    pub fn with_source_images(&mut self, server_image: &str, client_image: &str) {
        self.vars.insert(
            config::VAR_SERVER_SOURCE_IMAGE.to_string(),
            server_image.into(),
        );
        self.vars.insert(
            config::VAR_CLIENT_SOURCE_IMAGE.to_string(),
            client_image.into(),
        );
    }

    /// String value of a variable, if set and a string
    pub fn var_str(&self, name: &str) -> Option<&str> {
        match self.vars.get(name) {
            Some(TfVar::Str(s)) => Some(s),
            _ => None,
        }
    }

    fn tfvars_path(&self) -> PathBuf {
        self.terraform_dir.join(TFVARS_FILE_NAME)
    }

    fn write_tfvars(&self) -> Result<PathBuf> {
        let path = self.tfvars_path();
        std::fs::write(&path, serde_json::to_vec_pretty(&self.vars)?)?;
        Ok(path)
    }
}

/// Outputs of an applied template
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateOutputs(BTreeMap<String, serde_json::Value>);

impl TemplateOutputs {
    /// Parse the JSON printed by `terraform output -json`.
    pub fn from_terraform_json(json: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct Output {
            value: serde_json::Value,
        }

        let raw: BTreeMap<String, Output> = serde_json::from_str(json)?;
        Ok(Self(raw.into_iter().map(|(k, o)| (k, o.value)).collect()))
    }

    /// A string output that must be present and non-empty
    pub fn required(&self, name: &str) -> Result<String> {
        match self.0.get(name) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            Some(serde_json::Value::Null) | None => Err(Error::infra(format!(
                "required output {} is missing",
                name
            ))),
            Some(other) => Err(Error::infra(format!(
                "output {} is not a non-empty string: {}",
                name, other
            ))),
        }
    }
}

impl FromIterator<(String, serde_json::Value)> for TemplateOutputs {
    fn from_iter<I: IntoIterator<Item = (String, serde_json::Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Apply and destroy the infrastructure template
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Infrastructure: Send + Sync {
    /// Initialise the working directory and apply; safe to repeat with new vars
    async fn init_and_apply(&self, options: &DeployOptions) -> Result<TemplateOutputs>;

    /// Read outputs of the last apply
    async fn outputs(&self, options: &DeployOptions) -> Result<TemplateOutputs>;

    /// Destroy everything the template created
    async fn destroy(&self, options: &DeployOptions) -> Result<()>;
}

/// [`Infrastructure`] backed by the `terraform` CLI
#[derive(Debug, Clone)]
pub struct TerraformCli {
    binary: String,
}

impl TerraformCli {
    pub fn new() -> Self {
        Self {
            binary: "terraform".to_string(),
        }
    }

    fn command(&self, options: &DeployOptions) -> CommandSpec {
        CommandSpec::new(&self.binary)
            .current_dir(&options.terraform_dir)
            .env("TF_IN_AUTOMATION", "1")
    }
}

impl Default for TerraformCli {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn apply_args(tfvars: &Path) -> Vec<String> {
    vec![
        "apply".to_string(),
        "-input=false".to_string(),
        "-auto-approve".to_string(),
        "-lock=false".to_string(),
        format!("-var-file={}", tfvars.display()),
    ]
}

pub(crate) fn destroy_args(tfvars: &Path) -> Vec<String> {
    vec![
        "destroy".to_string(),
        "-input=false".to_string(),
        "-auto-approve".to_string(),
        "-lock=false".to_string(),
        format!("-var-file={}", tfvars.display()),
    ]
}

#[async_trait]
impl Infrastructure for TerraformCli {
    async fn init_and_apply(&self, options: &DeployOptions) -> Result<TemplateOutputs> {
        let tfvars = options.write_tfvars()?;
        info!(dir = %options.terraform_dir.display(), "Running terraform init");
        run_cmd(&self.command(options).args(["init", "-input=false", "-upgrade=false"]))
            .await
            .map_err(|e| Error::infra(format!("terraform init failed: {}", e)))?;

        info!(dir = %options.terraform_dir.display(), "Running terraform apply");
        run_cmd(&self.command(options).args(apply_args(&tfvars)))
            .await
            .map_err(|e| Error::infra(format!("terraform apply failed: {}", e)))?;

        self.outputs(options).await
    }

    async fn outputs(&self, options: &DeployOptions) -> Result<TemplateOutputs> {
        let output = run_cmd(&self.command(options).args(["output", "-json"]))
            .await
            .map_err(|e| Error::infra(format!("terraform output failed: {}", e)))?;
        TemplateOutputs::from_terraform_json(&output.stdout)
    }

    async fn destroy(&self, options: &DeployOptions) -> Result<()> {
        let tfvars = options.write_tfvars()?;
        info!(dir = %options.terraform_dir.display(), "Running terraform destroy");
        run_cmd(&self.command(options).args(destroy_args(&tfvars)))
            .await
            .map_err(|e| Error::infra(format!("terraform destroy failed: {}", e)))?;
        Ok(())
    }
}

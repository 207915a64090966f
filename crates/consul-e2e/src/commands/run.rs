//! Run command - execute the staged Consul cluster scenario against GCP
//!
//! Requires `packer`, `terraform` and `gcloud` on the PATH and a GCP project
//! in the environment. Stages can be skipped with `SKIP_<stage>` env vars,
//! or everything but one stage with `--only`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use harness_common::HarnessRng;
use tracing::info;

use crate::cloud::GcloudCompute;
use crate::config::{
    project_id_from_env, HarnessConfig, DEFAULT_CONSUL_HTTP_PORT, DEFAULT_NUM_CLIENTS,
    DEFAULT_NUM_SERVERS, DEFAULT_PACKER_BUILD_NAME,
};
use crate::consul::ConsulConnector;
use crate::image::PackerBuilder;
use crate::infra::TerraformCli;
use crate::scenario::{Backends, Scenario};
use crate::stage::StageSkips;
use crate::state::TestRun;
use crate::Result;

/// Build, deploy and validate the Consul cluster example
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Root of the Terraform example to deploy
    #[arg(long, env = "CONSUL_E2E_TEMPLATE_DIR", default_value = ".")]
    pub template_dir: PathBuf,

    /// Packer template (defaults to examples/consul-image/consul.json under the template dir)
    #[arg(long)]
    pub packer_template: Option<PathBuf>,

    /// Packer build to run
    #[arg(long, default_value = DEFAULT_PACKER_BUILD_NAME)]
    pub build_name: String,

    /// Use this working directory instead of a private temp copy
    #[arg(long, env = "CONSUL_E2E_WORK_DIR")]
    pub work_dir: Option<PathBuf>,

    /// GCP project (defaults to GOOGLE_CLOUD_PROJECT and friends)
    #[arg(long)]
    pub project: Option<String>,

    #[arg(long, default_value_t = DEFAULT_NUM_SERVERS)]
    pub servers: u32,

    #[arg(long, default_value_t = DEFAULT_NUM_CLIENTS)]
    pub clients: u32,

    /// Consul HTTP API port
    #[arg(long, default_value_t = DEFAULT_CONSUL_HTTP_PORT)]
    pub consul_port: u16,

    /// Only pick regions from this list
    #[arg(long, value_delimiter = ',')]
    pub approved_regions: Vec<String>,

    /// Never pick these regions
    #[arg(long, value_delimiter = ',')]
    pub forbidden_regions: Vec<String>,

    /// Run only this stage, skipping all others
    #[arg(long)]
    pub only: Option<String>,

    /// Seed for member selection and resource names
    #[arg(long)]
    pub seed: Option<u64>,

    /// Keep the private working copy after the run
    #[arg(long)]
    pub keep_work_dir: bool,
}

impl RunArgs {
    /// Turn the arguments into the run's immutable configuration
    pub fn to_config(&self, project_id: String) -> HarnessConfig {
        let mut config = HarnessConfig::new(project_id, &self.template_dir);
        if let Some(template) = &self.packer_template {
            config.packer_template = template.clone();
        }
        config.packer_build_name = self.build_name.clone();
        config.work_dir = self.work_dir.clone();
        config.num_servers = self.servers;
        config.num_clients = self.clients;
        config.consul_port = self.consul_port;
        config.approved_regions = self.approved_regions.clone();
        config.forbidden_regions = self.forbidden_regions.clone();
        config
    }

    /// `--only` wins over `SKIP_*` env vars
    pub fn stage_skips(&self) -> Result<StageSkips> {
        match &self.only {
            Some(stage) => StageSkips::only(stage),
            None => Ok(StageSkips::from_env()),
        }
    }

    fn rng(&self) -> HarnessRng {
        match self.seed {
            Some(seed) => HarnessRng::seeded(seed),
            None => HarnessRng::from_entropy(),
        }
    }
}

fn real_backends(config: &HarnessConfig) -> Backends {
    Backends {
        images: Arc::new(PackerBuilder::new()),
        infra: Arc::new(TerraformCli::new()),
        cloud: Arc::new(GcloudCompute::new(config.cloud_command_timeout)),
        connector: Arc::new(ConsulConnector::new(
            config.consul_port,
            config.request_timeout,
        )),
    }
}

pub async fn run(args: RunArgs) -> Result<()> {
    let project_id = match &args.project {
        Some(project) => project.clone(),
        None => project_id_from_env()?,
    };
    let config = args.to_config(project_id);
    config.validate()?;
    let skips = args.stage_skips()?;
    let rng = args.rng();

    info!(
        project = %config.project_id,
        servers = config.num_servers,
        clients = config.num_clients,
        "Starting consul cluster e2e run"
    );

    let test_run = TestRun::prepare(
        &config.template_dir,
        config.work_dir.as_deref(),
        skips.any(),
        &rng.unique_id(),
    )?;

    let backends = real_backends(&config);
    let scenario = Scenario::new(config, backends, rng);
    let report = scenario.run(&test_run, skips.clone()).await;

    test_run.finish_after(&report, args.keep_work_dir || skips.any());
    report.verdict
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage;
    use crate::{Cli, Commands};
    use clap::Parser;

    fn parse(args: &[&str]) -> RunArgs {
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Commands::Run(args) => args,
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn defaults_describe_three_servers_and_four_clients() {
        let args = parse(&["consul-e2e", "run", "--template-dir", "/repo"]);
        let config = args.to_config("proj".to_string());
        assert_eq!(config.expected_members(), 7);
        assert_eq!(config.consul_port, 8500);
        assert_eq!(config.packer_build_name, "googlecompute");
        assert_eq!(
            config.packer_template,
            PathBuf::from("/repo/examples/consul-image/consul.json")
        );
        assert!(config.work_dir.is_none());
    }

    #[test]
    fn flags_override_the_defaults() {
        let args = parse(&[
            "consul-e2e",
            "run",
            "--template-dir",
            "/repo",
            "--packer-template",
            "/images/consul.json",
            "--servers",
            "5",
            "--clients",
            "2",
            "--approved-regions",
            "us-east1,us-west1",
            "--seed",
            "7",
        ]);
        let config = args.to_config("proj".to_string());
        assert_eq!(config.expected_members(), 7);
        assert_eq!(config.num_servers, 5);
        assert_eq!(config.packer_template, PathBuf::from("/images/consul.json"));
        assert_eq!(config.approved_regions, vec!["us-east1", "us-west1"]);
        assert_eq!(args.seed, Some(7));
    }

    #[test]
    fn only_skips_every_other_stage() {
        let args = parse(&["consul-e2e", "run", "--only", "validate"]);
        let skips = args.stage_skips().unwrap();
        assert!(!skips.is_skipped(stage::VALIDATE));
        assert!(skips.is_skipped(stage::DEPLOY));
        assert!(skips.is_skipped(stage::TEARDOWN));
    }

    #[test]
    fn only_rejects_unknown_stages() {
        let args = parse(&["consul-e2e", "run", "--only", "validat"]);
        assert!(args.stage_skips().is_err());
    }

    #[test]
    fn seeded_runs_generate_the_same_ids() {
        let args = parse(&["consul-e2e", "run", "--seed", "99"]);
        assert_eq!(args.rng().unique_id(), args.rng().unique_id());
    }

    #[test]
    fn stages_subcommand_parses() {
        let cli = Cli::try_parse_from(["consul-e2e", "stages"]).unwrap();
        assert!(matches!(cli.command, Commands::Stages));
    }
}

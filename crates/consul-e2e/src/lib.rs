//! End-to-end harness for the Consul on GCP cluster example
//!
//! Builds a Consul machine image with Packer, deploys server and client
//! instance groups with Terraform, and checks that the cluster converges,
//! elects a leader, and keeps its KV data across a rolling redeploy onto a
//! second image.

pub mod cloud;
pub mod commands;
pub mod config;
pub mod consul;
pub mod discovery;
pub mod error;
pub mod image;
pub mod infra;
pub mod kv;
pub mod lifecycle;
pub mod probe;
pub mod scenario;
pub mod stage;
pub mod state;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};

/// consul-e2e - build, deploy and validate a Consul cluster on GCP
#[derive(Parser, Debug)]
#[command(name = "consul-e2e")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the build/deploy/validate/redeploy sequence
    Run(commands::run::RunArgs),
    /// List stage names in execution order
    Stages,
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Run(args) => commands::run::run(args).await,
            Commands::Stages => {
                commands::print_stages();
                Ok(())
            }
        }
    }
}

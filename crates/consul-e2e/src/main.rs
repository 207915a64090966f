//! consul-e2e
//!
//! Drives the Consul on GCP example through a full image build, deploy,
//! validate and rolling redeploy cycle.

use clap::Parser;

use consul_e2e::{Cli, Result};

#[tokio::main]
async fn main() -> Result<()> {
    harness_common::telemetry::init_tracing();

    let cli = Cli::parse();
    cli.run().await
}

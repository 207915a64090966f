//! CLI commands

use crate::stage::{ALL_STAGES, SKIP_ENV_PREFIX};

pub mod run;

/// Print every stage with the env var that skips it
pub fn print_stages() {
    for stage in ALL_STAGES {
        println!("{:<22} {}{}", stage, SKIP_ENV_PREFIX, stage);
    }
}

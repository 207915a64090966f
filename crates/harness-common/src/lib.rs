//! Shared plumbing for the Consul cluster end-to-end harness: bounded polling,
//! external tool invocation, injectable randomness and tracing setup.

#![deny(missing_docs)]

pub mod process;
pub mod random;
pub mod retry;
pub mod telemetry;

pub use process::{run_cmd, CommandError, CommandOutput, CommandSpec};
pub use random::HarnessRng;
pub use retry::{retry_fixed, retry_with_backoff, Exhausted, PollError, PollPolicy, RetryConfig};

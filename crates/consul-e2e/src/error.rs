//! Error types for the harness

use std::path::PathBuf;

use harness_common::{CommandError, Exhausted, PollError};

/// Harness Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Harness errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("image build failed: {message}")]
    ImageBuild { message: String },

    #[error("infrastructure error: {message}")]
    Infra { message: String },

    #[error("cloud api error: {message}")]
    Cloud { message: String },

    #[error("could not find any instances in instance group {group} in {region}")]
    EmptyGroup { group: String, region: String },

    #[error("consul api error at {address}: {message}")]
    ConsulApi { address: String, message: String },

    #[error("expected {expected} members, found {found}")]
    MemberCountMismatch { expected: usize, found: usize },

    #[error("consul returned an empty leader, so a leader must not have been elected yet")]
    NoLeader,

    #[error("key {key} not found in consul")]
    KeyMissing { key: String },

    #[error("key {key} has value {actual:?}, expected {expected:?}")]
    KeyValueMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("no saved value {name} in {}", dir.display())]
    MissingState { name: String, dir: PathBuf },

    #[error("timed out after {attempts} attempts waiting for {description}: {last_error}")]
    Timeout {
        description: String,
        attempts: u32,
        last_error: String,
    },

    #[error("stage {stage} failed: {message}")]
    StageFailed { stage: String, message: String },
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }

    pub fn image_build(message: impl Into<String>) -> Self {
        Error::ImageBuild {
            message: message.into(),
        }
    }

    pub fn infra(message: impl Into<String>) -> Self {
        Error::Infra {
            message: message.into(),
        }
    }

    pub fn cloud(message: impl Into<String>) -> Self {
        Error::Cloud {
            message: message.into(),
        }
    }

    pub fn consul_api(address: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConsulApi {
            address: address.into(),
            message: message.into(),
        }
    }

    /// Whether the failure is expected to clear up on its own while the
    /// cloud or the cluster converges. Transient errors are retried within a
    /// poll budget; everything else fails the stage immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::EmptyGroup { .. }
                | Error::Cloud { .. }
                | Error::ConsulApi { .. }
                | Error::Http(_)
                | Error::MemberCountMismatch { .. }
                | Error::NoLeader
        )
    }
}

impl From<PollError<Error>> for Error {
    fn from(e: PollError<Error>) -> Self {
        match e {
            PollError::Exhausted(exhausted) => exhausted.into(),
            PollError::Terminal(e) => e,
        }
    }
}

impl<E: std::fmt::Display> From<Exhausted<E>> for Error {
    fn from(e: Exhausted<E>) -> Self {
        Error::Timeout {
            description: e.description,
            attempts: e.attempts,
            last_error: e.last_error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_mismatch_names_expected_and_actual_counts() {
        let err = Error::MemberCountMismatch {
            expected: 7,
            found: 5,
        };
        assert_eq!(err.to_string(), "expected 7 members, found 5");
        assert!(err.is_transient());
    }

    #[test]
    fn convergence_errors_are_transient() {
        assert!(Error::NoLeader.is_transient());
        assert!(Error::EmptyGroup {
            group: "consul-server".into(),
            region: "us-east1".into()
        }
        .is_transient());
        assert!(Error::consul_api("10.0.0.1", "connection refused").is_transient());
    }

    #[test]
    fn build_and_kv_errors_are_terminal() {
        assert!(!Error::image_build("packer exited 1").is_transient());
        assert!(!Error::infra("terraform apply failed").is_transient());
        assert!(!Error::KeyMissing { key: "k".into() }.is_transient());
        assert!(!Error::config("no project").is_transient());
    }

    #[test]
    fn unreadable_cloud_output_is_terminal_but_cloud_hiccups_are_not() {
        let json = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert!(!Error::Json(json).is_transient());
        assert!(Error::cloud("instance consul-0 has no public IP yet").is_transient());
    }

    #[test]
    fn terminal_poll_errors_pass_through_unchanged() {
        let err: Error = PollError::Terminal(Error::config("no project")).into();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn exhausted_polls_become_timeouts_with_the_last_condition() {
        let exhausted = Exhausted {
            description: "consul cluster via group consul-server-abc".to_string(),
            attempts: 60,
            last_error: Error::MemberCountMismatch {
                expected: 7,
                found: 5,
            },
        };
        let err: Error = exhausted.into();
        let msg = err.to_string();
        assert!(msg.contains("60 attempts"));
        assert!(msg.contains("consul-server-abc"));
        assert!(msg.contains("expected 7 members, found 5"));
    }

    #[test]
    fn missing_state_names_the_value_and_directory() {
        let err = Error::MissingState {
            name: "Artifact".into(),
            dir: PathBuf::from("/tmp/run/.test-data"),
        };
        assert_eq!(err.to_string(), "no saved value Artifact in /tmp/run/.test-data");
    }
}

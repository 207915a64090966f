//! Image builder adapter (Packer)
//!
//! A build failure is terminal for the run: there is no retry, and the stage
//! that called it fails immediately.

use std::path::PathBuf;

use async_trait::async_trait;
use harness_common::{run_cmd, CommandSpec};
#[cfg(test)]
use mockall::automock;
use tracing::info;

use crate::config::{PACKER_VAR_PROJECT_ID, PACKER_VAR_ZONE};
use crate::{Error, Result};

/// Inputs of one image build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Packer template file
    pub template: PathBuf,
    /// Build in the template to run (`-only`)
    pub build_name: String,
    pub project_id: String,
    pub zone: String,
}

impl BuildRequest {
    pub fn validate(&self) -> Result<()> {
        if !self.template.is_file() {
            return Err(Error::image_build(format!(
                "packer template {} does not exist",
                self.template.display()
            )));
        }
        if self.build_name.is_empty() {
            return Err(Error::image_build("build name is empty"));
        }
        if self.project_id.is_empty() || self.zone.is_empty() {
            return Err(Error::image_build(format!(
                "project ({:?}) and zone ({:?}) must both be set",
                self.project_id, self.zone
            )));
        }
        Ok(())
    }

    fn packer_args(&self) -> Vec<String> {
        vec![
            "build".to_string(),
            "-machine-readable".to_string(),
            format!("-only={}", self.build_name),
            "-var".to_string(),
            format!("{}={}", PACKER_VAR_PROJECT_ID, self.project_id),
            "-var".to_string(),
            format!("{}={}", PACKER_VAR_ZONE, self.zone),
            self.template.display().to_string(),
        ]
    }
}

/// Builds machine images and returns their artifact ids
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build(&self, request: &BuildRequest) -> Result<String>;
}

/// [`ImageBuilder`] backed by the `packer` CLI
#[derive(Debug, Clone)]
pub struct PackerBuilder {
    binary: String,
}

impl PackerBuilder {
    pub fn new() -> Self {
        Self {
            binary: "packer".to_string(),
        }
    }
}

impl Default for PackerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageBuilder for PackerBuilder {
    async fn build(&self, request: &BuildRequest) -> Result<String> {
        request.validate()?;
        info!(
            template = %request.template.display(),
            build = %request.build_name,
            zone = %request.zone,
            "Building image with packer"
        );

        let output = run_cmd(&CommandSpec::new(&self.binary).args(request.packer_args()))
            .await
            .map_err(|e| Error::image_build(e.to_string()))?;

        let artifact = parse_artifact_id(&output.stdout).ok_or_else(|| {
            Error::image_build(format!(
                "packer build {} finished without reporting an artifact id",
                request.build_name
            ))
        })?;
        info!(artifact = %artifact, "Image built");
        Ok(artifact)
    }
}

/// Extract the artifact id from `packer build -machine-readable` output.
///
/// Machine-readable lines look like
/// `1700000000,googlecompute,artifact,0,id,consul-ubuntu-1700000000`.
/// If several artifacts are reported, the last one wins.
pub fn parse_artifact_id(output: &str) -> Option<String> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.trim().splitn(6, ',').collect();
            match fields.as_slice() {
                [_, _, "artifact", _, "id", id] if !id.trim().is_empty() => {
                    Some(id.trim().to_string())
                }
                _ => None,
            }
        })
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PACKER_OUTPUT: &str = "\
1700000000,,ui,say,==> googlecompute: Checking image does not exist...
1700000001,,ui,say,==> googlecompute: Creating instance...
1700000050,googlecompute,artifact-count,1
1700000050,googlecompute,artifact,0,builder-id,packer.googlecompute
1700000050,googlecompute,artifact,0,id,consul-ubuntu-1700000000
1700000050,googlecompute,artifact,0,string,A disk image was created: consul-ubuntu-1700000000
1700000050,googlecompute,artifact,0,end
";

    #[test]
    fn artifact_id_is_read_from_machine_readable_output() {
        assert_eq!(
            parse_artifact_id(PACKER_OUTPUT).as_deref(),
            Some("consul-ubuntu-1700000000")
        );
    }

    #[test]
    fn output_without_artifact_has_no_id() {
        assert_eq!(
            parse_artifact_id("1700000000,,ui,error,Build 'googlecompute' errored"),
            None
        );
        assert_eq!(parse_artifact_id(""), None);
    }

    #[test]
    fn last_reported_artifact_wins() {
        let output = "1,a,artifact,0,id,first\n2,b,artifact,0,id,second\n";
        assert_eq!(parse_artifact_id(output).as_deref(), Some("second"));
    }

    #[test]
    fn request_requires_an_existing_template() {
        let request = BuildRequest {
            template: PathBuf::from("/nonexistent/consul.json"),
            build_name: "googlecompute".into(),
            project_id: "p".into(),
            zone: "us-east1-b".into(),
        };
        let err = request.validate().unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn request_requires_project_and_zone() {
        let template = tempfile::NamedTempFile::new().unwrap();
        let mut request = BuildRequest {
            template: template.path().to_path_buf(),
            build_name: "googlecompute".into(),
            project_id: "p".into(),
            zone: String::new(),
        };
        assert!(request.validate().is_err());
        request.zone = "us-east1-b".into();
        assert!(request.validate().is_ok());
    }

    #[test]
    fn packer_is_invoked_with_only_and_both_vars() {
        let request = BuildRequest {
            template: PathBuf::from("examples/consul-image/consul.json"),
            build_name: "googlecompute".into(),
            project_id: "proj".into(),
            zone: "us-east1-b".into(),
        };
        assert_eq!(
            request.packer_args(),
            vec![
                "build",
                "-machine-readable",
                "-only=googlecompute",
                "-var",
                "project_id=proj",
                "-var",
                "zone=us-east1-b",
                "examples/consul-image/consul.json",
            ]
        );
    }
}

//! Per-run working copy and persisted stage state
//!
//! Every run gets its own copy of the Terraform templates so concurrent runs
//! never share `.terraform` directories or state files. Values produced by
//! one stage (project, region, image ids, deploy options, key names) are
//! stored as small JSON files under `<work_dir>/.test-data/`, which lets a
//! later process re-run a single stage against an existing deployment.
//!
//! When any stage is skipped the templates are used in place instead of
//! copied, so a follow-up invocation finds the same `.test-data` again.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::infra::DeployOptions;
use crate::stage::RunReport;
use crate::{Error, Result};

/// Directory (inside the working copy) holding persisted values
pub const TEST_DATA_DIR: &str = ".test-data";

pub const KEY_PROJECT_ID: &str = "GCPProjectID";
pub const KEY_REGION: &str = "GCPRegion";
pub const KEY_ZONE: &str = "GCPZone";
pub const KEY_ARTIFACT: &str = "Artifact";
pub const KEY_ARTIFACT_2: &str = "Artifact2";
pub const KEY_DEPLOY_OPTIONS: &str = "TerraformOptions";
pub const KEY_KV_KEY: &str = "ConsulKeyName";

/// Image generation built by the harness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageGeneration {
    /// Image the cluster is first deployed from
    First,
    /// Image the cluster is redeployed onto
    Second,
}

impl ImageGeneration {
    pub const ALL: [ImageGeneration; 2] = [ImageGeneration::First, ImageGeneration::Second];

    fn key(self) -> &'static str {
        match self {
            ImageGeneration::First => KEY_ARTIFACT,
            ImageGeneration::Second => KEY_ARTIFACT_2,
        }
    }
}

/// One harness invocation's working directory
#[derive(Debug)]
pub struct TestRun {
    work_dir: PathBuf,
    copied: bool,
    store: RunStore,
}

impl TestRun {
    /// Prepare the working directory for a run.
    ///
    /// - `explicit` wins if given; the templates are copied there only when
    ///   it does not exist yet, and it is never removed afterwards.
    /// - With `resumable` set the template directory is used in place.
    /// - Otherwise the templates are copied into a fresh directory under the
    ///   system temp dir, namespaced by `unique_id`.
    pub fn prepare(
        template_dir: &Path,
        explicit: Option<&Path>,
        resumable: bool,
        unique_id: &str,
    ) -> Result<Self> {
        if let Some(dir) = explicit {
            if !dir.exists() {
                copy_template_tree(template_dir, dir)?;
            }
            info!(dir = %dir.display(), "Using explicit working directory");
            return Ok(Self::at(dir.to_path_buf(), false));
        }

        if resumable {
            info!(
                dir = %template_dir.display(),
                "Stages are being skipped, using templates in place so state can be reused"
            );
            return Ok(Self::at(template_dir.to_path_buf(), false));
        }

        let dir_name = template_dir
            .canonicalize()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "templates".to_string());
        let dest = std::env::temp_dir()
            .join(format!("consul-e2e-{}", unique_id))
            .join(dir_name);
        copy_template_tree(template_dir, &dest)?;
        info!(
            from = %template_dir.display(),
            to = %dest.display(),
            "Copied templates to private working directory"
        );
        Ok(Self::at(dest, true))
    }

    fn at(work_dir: PathBuf, copied: bool) -> Self {
        let store = RunStore::new(&work_dir);
        Self {
            work_dir,
            copied,
            store,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    /// Clean up after `report`. A failed teardown keeps the private copy,
    /// since its Terraform state is what still tracks the live resources.
    pub fn finish_after(self, report: &RunReport, keep: bool) {
        if report.teardown_failed() && self.copied {
            warn!(
                dir = %self.work_dir.display(),
                "Teardown failed, keeping working directory and its Terraform state for manual destroy"
            );
        }
        self.finish(keep || report.teardown_failed());
    }

    /// Remove the private copy unless it must stay around for resumption.
    pub fn finish(self, keep: bool) {
        if keep || !self.copied {
            debug!(dir = %self.work_dir.display(), "Leaving working directory in place");
            return;
        }
        // The copy lives one level below the per-run directory
        let run_root = self.work_dir.parent().unwrap_or(&self.work_dir);
        if let Err(e) = fs::remove_dir_all(run_root) {
            warn!(dir = %run_root.display(), error = %e, "Failed to remove working directory");
        }
    }
}

/// Whether a template entry should be left out of a working copy
fn skip_when_copying(name: &str) -> bool {
    name.starts_with('.') || name.contains(".tfstate") || name == "target"
}

/// Recursively copy `src` into `dest`, leaving out hidden entries, Terraform
/// state and build output.
pub fn copy_template_tree(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if skip_when_copying(&name.to_string_lossy()) {
            continue;
        }
        let from = entry.path();
        let to = dest.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_template_tree(&from, &to)?;
        } else if file_type.is_file() {
            fs::copy(&from, &to)?;
        } else if file_type.is_symlink() {
            // Follow links; templates reference modules through relative paths
            if from.is_dir() {
                copy_template_tree(&from, &to)?;
            } else if from.is_file() {
                fs::copy(&from, &to)?;
            }
        }
    }
    Ok(())
}

/// Named JSON values persisted between stages
#[derive(Debug, Clone)]
pub struct RunStore {
    dir: PathBuf,
}

impl RunStore {
    pub fn new(work_dir: &Path) -> Self {
        Self {
            dir: work_dir.join(TEST_DATA_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).is_file()
    }

    pub fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(name);
        fs::write(&path, serde_json::to_vec_pretty(value)?)?;
        debug!(name = %name, path = %path.display(), "Saved test data");
        Ok(())
    }

    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let path = self.path_for(name);
        let data = fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::MissingState {
                name: name.to_string(),
                dir: self.dir.clone(),
            },
            _ => Error::Io(e),
        })?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn save_string(&self, name: &str, value: &str) -> Result<()> {
        self.save(name, &value)
    }

    pub fn load_string(&self, name: &str) -> Result<String> {
        self.load(name)
    }

    pub fn save_artifact_id(&self, generation: ImageGeneration, id: &str) -> Result<()> {
        self.save_string(generation.key(), id)
    }

    pub fn load_artifact_id(&self, generation: ImageGeneration) -> Result<String> {
        self.load_string(generation.key())
    }

    /// Every image generation that has been built so far, in build order
    pub fn artifact_ids(&self) -> Vec<String> {
        ImageGeneration::ALL
            .iter()
            .filter(|g| self.exists(g.key()))
            .filter_map(|g| match self.load_artifact_id(*g) {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(error = %e, "Unreadable artifact id");
                    None
                }
            })
            .collect()
    }

    pub fn save_deploy_options(&self, options: &DeployOptions) -> Result<()> {
        self.save(KEY_DEPLOY_OPTIONS, options)
    }

    pub fn load_deploy_options(&self) -> Result<DeployOptions> {
        self.load(KEY_DEPLOY_OPTIONS)
    }
}

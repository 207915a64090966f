//! Stage runner: named, skippable steps with guaranteed deferred cleanup.
//!
//! Stages run strictly in the order they are called. Setting `SKIP_<stage>`
//! in the environment turns a stage into a no-op, which is how a developer
//! re-runs e.g. only `validate` against a cluster deployed by an earlier
//! invocation. Once a stage fails, the remaining regular stages are recorded
//! as aborted; deferred stages (teardown, image cleanup) always run, in
//! reverse order of registration, and their failures never change the
//! verdict of the run.

use std::collections::BTreeSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::{Error, Result};

pub const SETUP_IMAGE: &str = "setup_image";
pub const DEPLOY: &str = "deploy";
pub const VALIDATE: &str = "validate";
pub const BUILD_2ND_IMAGE: &str = "build_2nd_image";
pub const REDEPLOY_CLUSTER: &str = "redeploy_cluster";
pub const VALIDATE_KEY_EXISTS: &str = "validate_key_exists";
pub const TEARDOWN: &str = "teardown";
pub const CLEANUP_IMAGES: &str = "cleanup_images";

/// Every stage in the order it executes (deferred stages last)
pub const ALL_STAGES: &[&str] = &[
    SETUP_IMAGE,
    DEPLOY,
    VALIDATE,
    BUILD_2ND_IMAGE,
    REDEPLOY_CLUSTER,
    VALIDATE_KEY_EXISTS,
    TEARDOWN,
    CLEANUP_IMAGES,
];

/// Prefix of the env vars that skip a stage
pub const SKIP_ENV_PREFIX: &str = "SKIP_";

/// Which stages to turn into no-ops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageSkips(BTreeSet<String>);

impl StageSkips {
    /// Skip nothing
    pub fn none() -> Self {
        Self::default()
    }

    /// Read `SKIP_<stage>` flags from the process environment
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Read `SKIP_<stage>` flags from the given variables. Any value,
    /// including an empty one, sets the flag. `SKIP_` variables that name
    /// no stage of this harness are ignored with a warning.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut skips = BTreeSet::new();
        for (key, _) in vars {
            let Some(stage) = key.as_ref().strip_prefix(SKIP_ENV_PREFIX) else {
                continue;
            };
            if ALL_STAGES.contains(&stage) {
                skips.insert(stage.to_string());
            } else {
                warn!(
                    variable = %key.as_ref(),
                    known_stages = %ALL_STAGES.join(", "),
                    "Ignoring skip flag for unknown stage"
                );
            }
        }
        Self(skips)
    }

    /// Run only `stage`, skipping every other known stage
    pub fn only(stage: &str) -> Result<Self> {
        if !ALL_STAGES.contains(&stage) {
            return Err(Error::config(format!(
                "unknown stage {}; known stages: {}",
                stage,
                ALL_STAGES.join(", ")
            )));
        }
        Ok(Self(
            ALL_STAGES
                .iter()
                .filter(|s| **s != stage)
                .map(|s| s.to_string())
                .collect(),
        ))
    }

    /// Also skip `stage`
    pub fn with(mut self, stage: &str) -> Self {
        self.0.insert(stage.to_string());
        self
    }

    pub fn is_skipped(&self, stage: &str) -> bool {
        self.0.contains(stage)
    }

    /// Whether any stage is skipped, meaning state must outlive this process
    pub fn any(&self) -> bool {
        !self.0.is_empty()
    }
}

/// How a stage ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Passed,
    Failed(String),
    Skipped,
    /// Not run because an earlier stage failed
    Aborted,
}

impl StageOutcome {
    fn tag(&self) -> &'static str {
        match self {
            StageOutcome::Passed => "PASS",
            StageOutcome::Failed(_) => "FAIL",
            StageOutcome::Skipped => "SKIP",
            StageOutcome::Aborted => "ABORT",
        }
    }
}

pub struct StageResult {
    pub name: String,
    pub outcome: StageOutcome,
    pub duration: Duration,
    pub deferred: bool,
}

/// What a finished run reports back to its caller
#[derive(Debug)]
pub struct RunReport {
    /// Pass/fail of the regular stages
    pub verdict: Result<()>,
    /// Deferred stages that failed and may have left resources behind
    pub failed_cleanup: Vec<String>,
}

impl RunReport {
    /// Whether `terraform destroy` did not go through, so its state is
    /// the only handle left on live resources
    pub fn teardown_failed(&self) -> bool {
        self.failed_cleanup.iter().any(|s| s == TEARDOWN)
    }
}

type DeferredStage<'a> = Box<dyn FnOnce() -> BoxFuture<'a, Result<()>> + Send + 'a>;

/// Executes stages for one run
pub struct StageRunner<'a> {
    suite: String,
    skips: StageSkips,
    results: Vec<StageResult>,
    failure: Option<(String, String)>,
    deferred: Vec<(String, DeferredStage<'a>)>,
}

impl<'a> StageRunner<'a> {
    pub fn new(suite: &str, skips: StageSkips) -> Self {
        Self {
            suite: suite.to_string(),
            skips,
            results: Vec::new(),
            failure: None,
            deferred: Vec::new(),
        }
    }

    /// Run a regular stage unless it is skipped or an earlier stage failed.
    pub async fn run<F, Fut>(&mut self, name: &str, f: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self.failure.is_some() {
            info!(stage = %name, "Not running stage, an earlier stage failed");
            self.record(name, StageOutcome::Aborted, Duration::ZERO, false);
            return;
        }
        if self.skips.is_skipped(name) {
            info!(stage = %name, "Skipping stage ({}{} is set)", SKIP_ENV_PREFIX, name);
            self.record(name, StageOutcome::Skipped, Duration::ZERO, false);
            return;
        }

        info!(stage = %name, "Running stage");
        let (outcome, duration) = execute(f()).await;
        if let StageOutcome::Failed(ref message) = outcome {
            error!(stage = %name, error = %message, "Stage failed");
            self.failure = Some((name.to_string(), message.clone()));
        }
        self.record(name, outcome, duration, false);
    }

    /// Register a stage that runs in [`finish`](Self::finish) no matter how
    /// the regular stages end. Deferred stages run last-registered-first.
    pub fn defer<F>(&mut self, name: &str, f: F)
    where
        F: FnOnce() -> BoxFuture<'a, Result<()>> + Send + 'a,
    {
        self.deferred.push((name.to_string(), Box::new(f)));
    }

    /// Run deferred stages, log a summary, and report the run's verdict
    /// along with any deferred stage that failed.
    pub async fn finish(mut self) -> RunReport {
        let mut failed_cleanup = Vec::new();
        while let Some((name, stage)) = self.deferred.pop() {
            if self.skips.is_skipped(&name) {
                info!(stage = %name, "Skipping deferred stage ({}{} is set)", SKIP_ENV_PREFIX, name);
                self.record(&name, StageOutcome::Skipped, Duration::ZERO, true);
                continue;
            }
            info!(stage = %name, "Running deferred stage");
            let (outcome, duration) = execute(stage()).await;
            if let StageOutcome::Failed(ref message) = outcome {
                warn!(stage = %name, error = %message, "Deferred stage failed, continuing");
                failed_cleanup.push(name.clone());
            }
            self.record(&name, outcome, duration, true);
        }

        self.log_summary();

        let verdict = match self.failure {
            Some((stage, message)) => Err(Error::StageFailed { stage, message }),
            None => Ok(()),
        };
        RunReport {
            verdict,
            failed_cleanup,
        }
    }

    pub fn results(&self) -> &[StageResult] {
        &self.results
    }

    fn record(&mut self, name: &str, outcome: StageOutcome, duration: Duration, deferred: bool) {
        self.results.push(StageResult {
            name: name.to_string(),
            outcome,
            duration,
            deferred,
        });
    }

    fn log_summary(&self) {
        let total: Duration = self.results.iter().map(|r| r.duration).sum();
        let passed = self
            .results
            .iter()
            .filter(|r| r.outcome == StageOutcome::Passed)
            .count();
        let failed = self
            .results
            .iter()
            .filter(|r| matches!(r.outcome, StageOutcome::Failed(_)))
            .count();

        info!("========================================");
        info!("  {}", self.suite.to_uppercase());
        info!("========================================");
        for r in &self.results {
            let name = if r.deferred {
                format!("{} (deferred)", r.name)
            } else {
                r.name.clone()
            };
            info!("  {:5}  {:32} {:.1}s", r.outcome.tag(), name, r.duration.as_secs_f64());
            if let StageOutcome::Failed(ref e) = r.outcome {
                let truncated: String = e.chars().take(200).collect();
                info!("         -> {truncated}");
            }
        }
        info!("----------------------------------------");
        info!(
            "  {} passed, {} failed ({:.1}s total)",
            passed,
            failed,
            total.as_secs_f64()
        );
        info!("========================================");
    }
}

/// Drive a stage future, turning errors and panics into a failed outcome.
async fn execute<Fut>(fut: Fut) -> (StageOutcome, Duration)
where
    Fut: Future<Output = Result<()>>,
{
    let start = Instant::now();
    let outcome = match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => StageOutcome::Passed,
        Ok(Err(e)) => StageOutcome::Failed(e.to_string()),
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            StageOutcome::Failed(format!("PANIC: {msg}"))
        }
    };
    (outcome, start.elapsed())
}

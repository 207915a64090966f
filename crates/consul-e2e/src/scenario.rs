//! The Consul cluster scenario
//!
//! build image -> deploy -> validate -> build second image -> rolling
//! redeploy -> validate the key survived, with teardown and image cleanup
//! deferred so they run however the sequence ends.
//!
//! Each stage reads what it needs from the run store rather than from the
//! previous stage, so any stage can be re-run alone in a later process.

use std::sync::Arc;

use futures::FutureExt;
use harness_common::HarnessRng;
use tracing::info;

use crate::cloud::{self, CloudCompute};
use crate::config::{HarnessConfig, OUTPUT_CLIENT_INSTANCE_GROUP, OUTPUT_SERVER_INSTANCE_GROUP};
use crate::consul::ClusterConnector;
use crate::discovery::{resolve_random_member_address, InstanceGroupRef};
use crate::image::{BuildRequest, ImageBuilder};
use crate::infra::{ClusterNames, DeployOptions, Infrastructure};
use crate::kv::{assert_key_present, put_random_key, KvRecord, PLACEHOLDER_VALUE};
use crate::lifecycle;
use crate::probe::{wait_until_healthy, ClusterContext};
use crate::stage::{self, RunReport, StageRunner, StageSkips};
use crate::state::{
    ImageGeneration, RunStore, TestRun, KEY_DEPLOY_OPTIONS, KEY_KV_KEY, KEY_PROJECT_ID,
    KEY_REGION, KEY_ZONE,
};
use crate::{Error, Result};

/// External systems the scenario drives
#[derive(Clone)]
pub struct Backends {
    pub images: Arc<dyn ImageBuilder>,
    pub infra: Arc<dyn Infrastructure>,
    pub cloud: Arc<dyn CloudCompute>,
    pub connector: Arc<dyn ClusterConnector>,
}

/// Server and client instance groups of one deployment
struct Groups {
    server: InstanceGroupRef,
    client: InstanceGroupRef,
}

pub struct Scenario {
    config: HarnessConfig,
    backends: Backends,
    rng: HarnessRng,
}

impl Scenario {
    pub fn new(config: HarnessConfig, backends: Backends, rng: HarnessRng) -> Self {
        Self {
            config,
            backends,
            rng,
        }
    }

    /// Run every stage not in `skips` against `run`'s working directory.
    pub async fn run(&self, run: &TestRun, skips: StageSkips) -> RunReport {
        let store = run.store();
        let mut runner = StageRunner::new("consul cluster e2e", skips);

        runner
            .run(stage::SETUP_IMAGE, || self.setup_image(store))
            .await;

        runner.defer(stage::CLEANUP_IMAGES, move || {
            self.cleanup_images(store).boxed()
        });
        runner.defer(stage::TEARDOWN, move || self.teardown(store).boxed());

        runner
            .run(stage::DEPLOY, || self.deploy(run.work_dir().to_path_buf(), store))
            .await;
        runner.run(stage::VALIDATE, || self.validate(store)).await;
        runner
            .run(stage::BUILD_2ND_IMAGE, || self.build_second_image(store))
            .await;
        runner
            .run(stage::REDEPLOY_CLUSTER, || self.redeploy(store))
            .await;
        runner
            .run(stage::VALIDATE_KEY_EXISTS, || self.validate_key_exists(store))
            .await;

        runner.finish().await
    }

    fn cluster(&self) -> ClusterContext<'_> {
        ClusterContext {
            cloud: self.backends.cloud.as_ref(),
            connector: self.backends.connector.as_ref(),
            rng: &self.rng,
            health_policy: self.config.health_policy,
        }
    }

    async fn build_image(&self, store: &RunStore, generation: ImageGeneration) -> Result<()> {
        let request = BuildRequest {
            template: self.config.packer_template.clone(),
            build_name: self.config.packer_build_name.clone(),
            project_id: store.load_string(KEY_PROJECT_ID)?,
            zone: store.load_string(KEY_ZONE)?,
        };
        let artifact = self.backends.images.build(&request).await?;
        store.save_artifact_id(generation, &artifact)?;
        info!(artifact = %artifact, generation = ?generation, "Saved image id");
        Ok(())
    }

    async fn setup_image(&self, store: &RunStore) -> Result<()> {
        let project = &self.config.project_id;
        let cloud = self.backends.cloud.as_ref();
        let region = cloud::pick_region(
            cloud,
            &self.rng,
            project,
            &self.config.approved_regions,
            &self.config.forbidden_regions,
        )
        .await?;
        let zone = cloud::pick_zone(cloud, &self.rng, project, &region).await?;

        store.save_string(KEY_PROJECT_ID, project)?;
        store.save_string(KEY_REGION, &region)?;
        store.save_string(KEY_ZONE, &zone)?;

        self.build_image(store, ImageGeneration::First).await
    }

    async fn deploy(&self, terraform_dir: std::path::PathBuf, store: &RunStore) -> Result<()> {
        // the project the image was built in, even if this process was
        // started against another one
        let project = store.load_string(KEY_PROJECT_ID)?;
        let region = store.load_string(KEY_REGION)?;
        let image = store.load_artifact_id(ImageGeneration::First)?;
        let names = ClusterNames::for_run(&self.rng.unique_id());
        info!(
            project = %project,
            server = %names.server,
            client = %names.client,
            "Deploying consul cluster"
        );

        let options = DeployOptions::for_cluster(
            &self.config,
            &terraform_dir,
            &project,
            &region,
            &names,
            &image,
        );
        // saved first so teardown can find it even if apply fails halfway
        store.save_deploy_options(&options)?;
        self.backends.infra.init_and_apply(&options).await?;
        Ok(())
    }

    async fn groups(&self, store: &RunStore) -> Result<Groups> {
        let project = store.load_string(KEY_PROJECT_ID)?;
        let region = store.load_string(KEY_REGION)?;
        let options = store.load_deploy_options()?;
        let outputs = self.backends.infra.outputs(&options).await?;

        Ok(Groups {
            server: InstanceGroupRef::new(
                project.clone(),
                region.clone(),
                outputs.required(OUTPUT_SERVER_INSTANCE_GROUP)?,
            ),
            client: InstanceGroupRef::new(
                project,
                region,
                outputs.required(OUTPUT_CLIENT_INSTANCE_GROUP)?,
            ),
        })
    }

    async fn wait_for_cluster(&self, groups: &Groups) -> Result<()> {
        let ctx = self.cluster();
        let expected = self.config.expected_members();
        for group in [&groups.server, &groups.client] {
            resolve_random_member_address(ctx.cloud, ctx.rng, group, &self.config.boot_policy)
                .await?;
            wait_until_healthy(&ctx, group, expected).await?;
        }
        Ok(())
    }

    async fn validate(&self, store: &RunStore) -> Result<()> {
        let groups = self.groups(store).await?;
        self.wait_for_cluster(&groups).await?;

        let record =
            put_random_key(&self.cluster(), &groups.server, &self.config.key_prefix).await?;
        store.save_string(KEY_KV_KEY, &record.key)
    }

    async fn build_second_image(&self, store: &RunStore) -> Result<()> {
        self.build_image(store, ImageGeneration::Second).await
    }

    async fn redeploy(&self, store: &RunStore) -> Result<()> {
        let mut options = store.load_deploy_options()?;
        let image = store.load_artifact_id(ImageGeneration::Second)?;
        options.with_source_images(&image, &image);
        store.save_deploy_options(&options)?;

        info!(image = %image, "Redeploying consul cluster onto the new image");
        self.backends.infra.init_and_apply(&options).await?;
        Ok(())
    }

    async fn validate_key_exists(&self, store: &RunStore) -> Result<()> {
        let groups = self.groups(store).await?;
        self.wait_for_cluster(&groups).await?;

        let record = KvRecord {
            key: store.load_string(KEY_KV_KEY)?,
            value: PLACEHOLDER_VALUE.to_string(),
        };
        assert_key_present(&self.cluster(), &groups.client, &record).await
    }

    async fn teardown(&self, store: &RunStore) -> Result<()> {
        if !store.exists(KEY_DEPLOY_OPTIONS) {
            info!("Nothing was deployed, skipping teardown");
            return Ok(());
        }
        let options = store.load_deploy_options()?;
        if lifecycle::teardown(self.backends.infra.as_ref(), &options).await {
            Ok(())
        } else {
            Err(Error::infra(format!(
                "could not destroy deployment in {}",
                options.terraform_dir.display()
            )))
        }
    }

    async fn cleanup_images(&self, store: &RunStore) -> Result<()> {
        let images = store.artifact_ids();
        if images.is_empty() {
            info!("No images were built, nothing to clean up");
            return Ok(());
        }
        let project = if store.exists(KEY_PROJECT_ID) {
            store.load_string(KEY_PROJECT_ID)?
        } else {
            self.config.project_id.clone()
        };

        let failed =
            lifecycle::cleanup_images(self.backends.cloud.as_ref(), &project, &images).await;
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::cloud(format!(
                "could not delete images: {}",
                failed.join(", ")
            )))
        }
    }
}

//! Teardown and image cleanup
//!
//! Both are best effort. Failures are logged and reported back to the
//! caller for the summary, never turned into a failed run.

use std::time::Duration;

use harness_common::{retry_with_backoff, RetryConfig};
use tracing::{error, info, warn};

use crate::cloud::CloudCompute;
use crate::infra::{DeployOptions, Infrastructure};

/// Attempts made at `terraform destroy` before giving up
pub const DESTROY_ATTEMPTS: u32 = 3;

fn destroy_retry() -> RetryConfig {
    RetryConfig {
        initial_delay: Duration::from_secs(10),
        ..RetryConfig::with_max_attempts(DESTROY_ATTEMPTS)
    }
}

/// Destroy the deployment. Returns whether the destroy went through.
pub async fn teardown(infra: &dyn Infrastructure, options: &DeployOptions) -> bool {
    info!(dir = %options.terraform_dir.display(), "Tearing down infrastructure");
    let destroy = || infra.destroy(options);
    match retry_with_backoff(&destroy_retry(), "terraform destroy", destroy).await {
        Ok(()) => {
            info!("Infrastructure destroyed");
            true
        }
        Err(e) => {
            error!(error = %e, "Teardown failed, resources may have leaked");
            false
        }
    }
}

/// Delete every image in `images`, continuing past failures.
///
/// Returns the images that could not be deleted.
pub async fn cleanup_images(
    cloud: &dyn CloudCompute,
    project: &str,
    images: &[String],
) -> Vec<String> {
    let mut failed = Vec::new();
    for image in images {
        match cloud.delete_image(project, image).await {
            Ok(()) => info!(image = %image, "Deleted image"),
            Err(e) => {
                warn!(image = %image, error = %e, "Failed to delete image");
                failed.push(image.clone());
            }
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MockCloudCompute;
    use crate::config::HarnessConfig;
    use crate::infra::{ClusterNames, MockInfrastructure};
    use crate::Error;
    use mockall::predicate::*;
    use std::path::Path;

    fn options() -> DeployOptions {
        DeployOptions::for_cluster(
            &HarnessConfig::new("proj", "/repo"),
            Path::new("/tmp/work"),
            "proj",
            "us-east1",
            &ClusterNames::for_run("abc123"),
            "image-1",
        )
    }

    #[tokio::test]
    async fn a_failed_first_delete_does_not_stop_the_second() {
        let mut cloud = MockCloudCompute::new();
        cloud
            .expect_delete_image()
            .with(eq("proj"), eq("image-1"))
            .times(1)
            .returning(|_, _| Err(Error::cloud("quota exceeded")));
        cloud
            .expect_delete_image()
            .with(eq("proj"), eq("image-2"))
            .times(1)
            .returning(|_, _| Ok(()));

        let failed =
            cleanup_images(&cloud, "proj", &["image-1".to_string(), "image-2".to_string()]).await;
        assert_eq!(failed, vec!["image-1".to_string()]);
    }

    #[tokio::test]
    async fn nothing_to_clean_makes_no_calls() {
        let mut cloud = MockCloudCompute::new();
        cloud.expect_delete_image().never();
        assert!(cleanup_images(&cloud, "proj", &[]).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_is_retried_then_given_up_quietly() {
        let mut infra = MockInfrastructure::new();
        infra
            .expect_destroy()
            .times(DESTROY_ATTEMPTS as usize)
            .returning(|_| Err(Error::infra("terraform destroy failed")));

        assert!(!teardown(&infra, &options()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_that_recovers_counts_as_success() {
        let mut infra = MockInfrastructure::new();
        let mut seq = mockall::Sequence::new();
        infra
            .expect_destroy()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(Error::infra("resource still in use")));
        infra
            .expect_destroy()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        assert!(teardown(&infra, &options()).await);
    }
}

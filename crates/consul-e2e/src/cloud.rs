//! Cloud compute API (GCP via `gcloud`)
//!
//! Only the handful of calls the harness needs: pick a region and zone,
//! list the members of a regional managed instance group, look up an
//! instance's public IP, and delete images.

use std::time::Duration;

use async_trait::async_trait;
use harness_common::{run_cmd, CommandError, CommandSpec, HarnessRng};
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use tracing::{debug, info};

use crate::{Error, Result};

/// A VM instance, addressable by zone and name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRef {
    pub name: String,
    pub zone: String,
}

impl InstanceRef {
    /// Parse an instance URL such as
    /// `https://www.googleapis.com/compute/v1/projects/p/zones/us-east1-b/instances/consul-abc`.
    pub fn from_url(url: &str) -> Option<Self> {
        let mut segments = url.trim_end_matches('/').rsplit('/');
        let name = segments.next()?;
        if segments.next()? != "instances" {
            return None;
        }
        let zone = segments.next()?;
        if segments.next()? != "zones" || name.is_empty() || zone.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            zone: zone.to_string(),
        })
    }
}

/// Compute operations the harness depends on
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudCompute: Send + Sync {
    /// Regions that are currently UP
    async fn regions(&self, project: &str) -> Result<Vec<String>>;

    /// Zones of `region` that are currently UP
    async fn zones(&self, project: &str, region: &str) -> Result<Vec<String>>;

    /// Current members of a regional managed instance group
    async fn instance_group_members(
        &self,
        project: &str,
        region: &str,
        group: &str,
    ) -> Result<Vec<InstanceRef>>;

    /// First external NAT IP of an instance
    async fn public_ip(&self, project: &str, instance: &InstanceRef) -> Result<String>;

    async fn delete_image(&self, project: &str, image: &str) -> Result<()>;
}

/// Pick a random region, honouring an approved list (if non-empty) and a
/// forbidden list.
pub async fn pick_region(
    cloud: &dyn CloudCompute,
    rng: &HarnessRng,
    project: &str,
    approved: &[String],
    forbidden: &[String],
) -> Result<String> {
    let candidates: Vec<String> = cloud
        .regions(project)
        .await?
        .into_iter()
        .filter(|r| approved.is_empty() || approved.contains(r))
        .filter(|r| !forbidden.contains(r))
        .collect();

    let region = rng
        .pick(&candidates)
        .cloned()
        .ok_or_else(|| Error::cloud(format!("no usable region in project {}", project)))?;
    info!(region = %region, "Picked region");
    Ok(region)
}

/// Pick a random zone within `region`
pub async fn pick_zone(
    cloud: &dyn CloudCompute,
    rng: &HarnessRng,
    project: &str,
    region: &str,
) -> Result<String> {
    let zones = cloud.zones(project, region).await?;
    let zone = rng
        .pick(&zones)
        .cloned()
        .ok_or_else(|| Error::cloud(format!("no usable zone in region {}", region)))?;
    info!(zone = %zone, "Picked zone");
    Ok(zone)
}

// =============================================================================
// gcloud implementation
// =============================================================================

#[derive(Debug, Deserialize)]
struct Region {
    name: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct Zone {
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    region: String,
}

#[derive(Debug, Deserialize)]
struct ManagedInstance {
    instance: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instance {
    #[serde(default)]
    network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterface {
    #[serde(default)]
    access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Deserialize)]
struct AccessConfig {
    #[serde(default, rename = "natIP")]
    nat_ip: Option<String>,
}

fn parse_up_regions(json: &str) -> Result<Vec<String>> {
    let regions: Vec<Region> = serde_json::from_str(json)?;
    Ok(regions
        .into_iter()
        .filter(|r| r.status == "UP")
        .map(|r| r.name)
        .collect())
}

fn parse_up_zones(json: &str, region: &str) -> Result<Vec<String>> {
    let zones: Vec<Zone> = serde_json::from_str(json)?;
    let suffix = format!("/regions/{}", region);
    Ok(zones
        .into_iter()
        .filter(|z| z.status == "UP")
        .filter(|z| z.region == region || z.region.ends_with(&suffix))
        .map(|z| z.name)
        .collect())
}

fn parse_group_members(json: &str) -> Result<Vec<InstanceRef>> {
    let managed: Vec<ManagedInstance> = serde_json::from_str(json)?;
    managed
        .into_iter()
        .map(|m| {
            InstanceRef::from_url(&m.instance)
                .ok_or_else(|| Error::cloud(format!("unrecognised instance url {}", m.instance)))
        })
        .collect()
}

fn parse_public_ip(json: &str) -> Result<Option<String>> {
    let instance: Instance = serde_json::from_str(json)?;
    Ok(instance
        .network_interfaces
        .into_iter()
        .flat_map(|n| n.access_configs)
        .filter_map(|a| a.nat_ip)
        .find(|ip| !ip.is_empty()))
}

/// [`CloudCompute`] backed by the `gcloud` CLI
#[derive(Debug, Clone)]
pub struct GcloudCompute {
    binary: String,
    timeout: Duration,
}

impl GcloudCompute {
    pub fn new(timeout: Duration) -> Self {
        Self {
            binary: "gcloud".to_string(),
            timeout,
        }
    }

    async fn gcloud_json(&self, project: &str, args: &[&str]) -> Result<String> {
        let spec = CommandSpec::new(&self.binary)
            .args(["compute"])
            .args(args.iter().copied())
            .arg(format!("--project={}", project))
            .arg("--format=json")
            .timeout(self.timeout);
        debug!(command = %spec.display(), "Querying gcloud");
        // gcloud failures are usually API hiccups; a missing binary is not
        let output = run_cmd(&spec).await.map_err(|e| {
            if matches!(e, CommandError::Spawn { .. }) {
                Error::Command(e)
            } else {
                Error::cloud(e.to_string())
            }
        })?;
        Ok(output.stdout)
    }
}

#[async_trait]
impl CloudCompute for GcloudCompute {
    async fn regions(&self, project: &str) -> Result<Vec<String>> {
        parse_up_regions(&self.gcloud_json(project, &["regions", "list"]).await?)
    }

    async fn zones(&self, project: &str, region: &str) -> Result<Vec<String>> {
        let filter = format!("--filter=region:{}", region);
        let json = self.gcloud_json(project, &["zones", "list", &filter]).await?;
        parse_up_zones(&json, region)
    }

    async fn instance_group_members(
        &self,
        project: &str,
        region: &str,
        group: &str,
    ) -> Result<Vec<InstanceRef>> {
        let region_flag = format!("--region={}", region);
        let json = self
            .gcloud_json(
                project,
                &[
                    "instance-groups",
                    "managed",
                    "list-instances",
                    group,
                    &region_flag,
                ],
            )
            .await?;
        // gcloud prints nothing at all for an empty group
        if json.trim().is_empty() {
            return Ok(Vec::new());
        }
        parse_group_members(&json)
    }

    async fn public_ip(&self, project: &str, instance: &InstanceRef) -> Result<String> {
        let zone_flag = format!("--zone={}", instance.zone);
        let json = self
            .gcloud_json(
                project,
                &["instances", "describe", &instance.name, &zone_flag],
            )
            .await?;
        parse_public_ip(&json)?.ok_or_else(|| {
            Error::cloud(format!(
                "instance {} in {} has no public IP yet",
                instance.name, instance.zone
            ))
        })
    }

    async fn delete_image(&self, project: &str, image: &str) -> Result<()> {
        info!(image = %image, "Deleting image");
        let spec = CommandSpec::new(&self.binary)
            .args(["compute", "images", "delete", image, "--quiet"])
            .arg(format!("--project={}", project))
            .timeout(self.timeout);
        run_cmd(&spec)
            .await
            .map_err(|e| Error::cloud(format!("failed to delete image {}: {}", image, e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::*;

    #[test]
    fn instance_urls_yield_zone_and_name() {
        let parsed = InstanceRef::from_url(
            "https://www.googleapis.com/compute/v1/projects/p/zones/us-east1-b/instances/consul-server-x1",
        )
        .unwrap();
        assert_eq!(parsed.zone, "us-east1-b");
        assert_eq!(parsed.name, "consul-server-x1");

        assert!(InstanceRef::from_url("https://example.com/not/an/instance").is_none());
        assert!(InstanceRef::from_url("").is_none());
    }

    #[test]
    fn only_up_regions_are_usable() {
        let json = r#"[
            {"name": "us-east1", "status": "UP"},
            {"name": "us-west9", "status": "DOWN"},
            {"name": "europe-west1", "status": "UP"}
        ]"#;
        assert_eq!(
            parse_up_regions(json).unwrap(),
            vec!["us-east1", "europe-west1"]
        );
    }

    #[test]
    fn zones_are_filtered_by_region_and_status() {
        let json = r#"[
            {"name": "us-east1-b", "status": "UP", "region": "https://www.googleapis.com/compute/v1/projects/p/regions/us-east1"},
            {"name": "us-east1-c", "status": "DOWN", "region": "https://www.googleapis.com/compute/v1/projects/p/regions/us-east1"},
            {"name": "us-east4-a", "status": "UP", "region": "https://www.googleapis.com/compute/v1/projects/p/regions/us-east4"}
        ]"#;
        assert_eq!(parse_up_zones(json, "us-east1").unwrap(), vec!["us-east1-b"]);
    }

    #[test]
    fn group_members_are_parsed_from_managed_instances() {
        let json = r#"[
            {"instance": "https://www.googleapis.com/compute/v1/projects/p/zones/us-east1-b/instances/a", "status": "RUNNING"},
            {"instance": "https://www.googleapis.com/compute/v1/projects/p/zones/us-east1-c/instances/b", "instanceStatus": "STAGING"}
        ]"#;
        let members = parse_group_members(json).unwrap();
        assert_eq!(
            members,
            vec![
                InstanceRef {
                    name: "a".into(),
                    zone: "us-east1-b".into()
                },
                InstanceRef {
                    name: "b".into(),
                    zone: "us-east1-c".into()
                },
            ]
        );
    }

    #[test]
    fn public_ip_is_the_first_nat_ip() {
        let json = r#"{
            "name": "a",
            "networkInterfaces": [
                {"networkIP": "10.0.0.2", "accessConfigs": [{"name": "External NAT", "natIP": "34.1.2.3"}]}
            ]
        }"#;
        assert_eq!(parse_public_ip(json).unwrap().as_deref(), Some("34.1.2.3"));

        let no_ip = r#"{"name": "a", "networkInterfaces": [{"networkIP": "10.0.0.2"}]}"#;
        assert_eq!(parse_public_ip(no_ip).unwrap(), None);
    }

    #[tokio::test]
    async fn region_choice_respects_approved_and_forbidden_lists() {
        let mut cloud = MockCloudCompute::new();
        cloud.expect_regions().with(eq("p")).returning(|_| {
            Ok(vec![
                "us-east1".to_string(),
                "us-west1".to_string(),
                "europe-west1".to_string(),
            ])
        });

        let rng = HarnessRng::seeded(11);
        let approved = vec!["us-east1".to_string(), "us-west1".to_string()];
        let forbidden = vec!["us-west1".to_string()];
        for _ in 0..10 {
            let region = pick_region(&cloud, &rng, "p", &approved, &forbidden)
                .await
                .unwrap();
            assert_eq!(region, "us-east1");
        }
    }

    #[tokio::test]
    async fn no_usable_region_is_an_error() {
        let mut cloud = MockCloudCompute::new();
        cloud
            .expect_regions()
            .returning(|_| Ok(vec!["us-east1".to_string()]));
        let rng = HarnessRng::seeded(1);
        let err = pick_region(&cloud, &rng, "p", &[], &["us-east1".to_string()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no usable region"));
    }

    #[tokio::test]
    async fn zone_is_picked_within_the_region() {
        let mut cloud = MockCloudCompute::new();
        cloud
            .expect_zones()
            .with(eq("p"), eq("us-east1"))
            .returning(|_, _| Ok(vec!["us-east1-b".to_string(), "us-east1-c".to_string()]));
        let rng = HarnessRng::seeded(5);
        let zone = pick_zone(&cloud, &rng, "p", "us-east1").await.unwrap();
        assert!(zone.starts_with("us-east1-"));
    }
}

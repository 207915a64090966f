//! Instance discovery
//!
//! Resolves an instance group to the public address of one of its members.
//! Members are chosen uniformly at random, so callers must not expect the
//! same member twice.

use harness_common::{retry_fixed, HarnessRng, PollPolicy};
use tracing::{debug, info};

use crate::cloud::CloudCompute;
use crate::{Error, Result};

/// A regional managed instance group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceGroupRef {
    pub project_id: String,
    pub region: String,
    pub group_name: String,
}

impl InstanceGroupRef {
    pub fn new(
        project_id: impl Into<String>,
        region: impl Into<String>,
        group_name: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            region: region.into(),
            group_name: group_name.into(),
        }
    }
}

/// Resolve one random member's public address, without retrying.
///
/// An empty group is [`Error::EmptyGroup`], which callers polling for
/// boot should treat as transient.
pub async fn resolve_member_address(
    cloud: &dyn CloudCompute,
    rng: &HarnessRng,
    group: &InstanceGroupRef,
) -> Result<String> {
    let members = cloud
        .instance_group_members(&group.project_id, &group.region, &group.group_name)
        .await?;

    let member = rng.pick(&members).ok_or_else(|| Error::EmptyGroup {
        group: group.group_name.clone(),
        region: group.region.clone(),
    })?;
    debug!(
        group = %group.group_name,
        members = members.len(),
        instance = %member.name,
        "Picked instance group member"
    );

    cloud.public_ip(&group.project_id, member).await
}

/// Poll until the group has a member with a public address.
pub async fn resolve_random_member_address(
    cloud: &dyn CloudCompute,
    rng: &HarnessRng,
    group: &InstanceGroupRef,
    policy: &PollPolicy,
) -> Result<String> {
    let description = format!("instances in group {}", group.group_name);
    let address = retry_fixed(policy, &description, Error::is_transient, || {
        resolve_member_address(cloud, rng, group)
    })
    .await?;
    info!(group = %group.group_name, address = %address, "Resolved instance group member");
    Ok(address)
}

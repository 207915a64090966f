//! Cluster health probe
//!
//! Polls a random member of an instance group until its agent reports the
//! exact expected member count and a non-empty leader.

use std::fmt;

use harness_common::{retry_fixed, HarnessRng, PollError, PollPolicy};
use tracing::{debug, info, warn};

use crate::cloud::CloudCompute;
use crate::consul::ClusterConnector;
use crate::discovery::{resolve_member_address, InstanceGroupRef};
use crate::{Error, Result};

/// Everything needed to reach the cluster from the outside
#[derive(Clone, Copy)]
pub struct ClusterContext<'a> {
    pub cloud: &'a dyn CloudCompute,
    pub connector: &'a dyn ClusterConnector,
    pub rng: &'a HarnessRng,
    pub health_policy: PollPolicy,
}

/// What one agent reported about the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterObservation {
    pub member_count: usize,
    pub leader: String,
}

impl ClusterObservation {
    /// Healthy means exactly `expected` members and an elected leader.
    pub fn check(&self, expected: usize) -> Result<()> {
        if self.member_count != expected {
            return Err(Error::MemberCountMismatch {
                expected,
                found: self.member_count,
            });
        }
        if self.leader.is_empty() {
            return Err(Error::NoLeader);
        }
        Ok(())
    }
}

/// Progress of a health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Unknown,
    Polling,
    Healthy,
    TimedOut,
}

impl fmt::Display for ProbeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProbeState::Unknown => "unknown",
            ProbeState::Polling => "polling",
            ProbeState::Healthy => "healthy",
            ProbeState::TimedOut => "timed out",
        };
        f.write_str(s)
    }
}

/// Read one observation through a freshly chosen member.
pub async fn observe(
    ctx: &ClusterContext<'_>,
    group: &InstanceGroupRef,
) -> Result<ClusterObservation> {
    let address = resolve_member_address(ctx.cloud, ctx.rng, group).await?;
    let api = ctx.connector.connect(&address).await?;
    let members = api.members().await?;
    let leader = api.leader().await?;
    debug!(
        address = %address,
        members = members.len(),
        leader = %leader,
        "Observed cluster"
    );
    Ok(ClusterObservation {
        member_count: members.len(),
        leader,
    })
}

/// Poll until the cluster is healthy or the health policy is spent.
///
/// Every attempt picks a member again, since rolling redeploys replace
/// instances under the probe. Transient failures count as "not yet"; any
/// other error ends the wait at once.
pub async fn wait_until_healthy(
    ctx: &ClusterContext<'_>,
    group: &InstanceGroupRef,
    expected: usize,
) -> Result<ClusterObservation> {
    let mut state = ProbeState::Unknown;
    info!(
        group = %group.group_name,
        expected_members = expected,
        state = %state,
        "Waiting for consul cluster to become healthy"
    );
    state = ProbeState::Polling;
    debug!(group = %group.group_name, state = %state, "Probe started");

    let description = format!(
        "consul cluster behind group {} to have {} members and a leader",
        group.group_name, expected
    );
    let result = retry_fixed(
        &ctx.health_policy,
        &description,
        Error::is_transient,
        move || async move {
            let observation = observe(ctx, group).await?;
            observation.check(expected)?;
            Ok::<_, Error>(observation)
        },
    )
    .await;

    match result {
        Ok(observation) => {
            state = ProbeState::Healthy;
            info!(
                group = %group.group_name,
                members = observation.member_count,
                leader = %observation.leader,
                state = %state,
                "Consul cluster is healthy"
            );
            Ok(observation)
        }
        Err(PollError::Exhausted(exhausted)) => {
            state = ProbeState::TimedOut;
            warn!(
                group = %group.group_name,
                state = %state,
                error = %exhausted.last_error,
                "Consul cluster never became healthy"
            );
            Err(exhausted.into())
        }
        Err(PollError::Terminal(e)) => {
            warn!(group = %group.group_name, error = %e, "Consul probe hit a non-retryable error");
            Err(e)
        }
    }
}

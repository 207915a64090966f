//! KV round-trip check
//!
//! A key is written through one member before the rolling redeploy and read
//! back through a (possibly different) member afterwards. Both sides run
//! once: the cluster is already known healthy when they are called.

use chrono::Utc;
use tracing::info;

use crate::discovery::{resolve_member_address, InstanceGroupRef};
use crate::probe::ClusterContext;
use crate::{Error, Result};

/// Value written under every generated key
pub const PLACEHOLDER_VALUE: &str = "bar";

/// A key/value pair written by the harness
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvRecord {
    pub key: String,
    pub value: String,
}

/// Build a key name unique across runs: `<prefix>-<utc timestamp>-<id>`.
pub fn unique_key_name(prefix: &str, unique_id: &str) -> String {
    format!(
        "{}-{}-{}",
        prefix,
        Utc::now().format("%Y%m%dT%H%M%S%.3fZ"),
        unique_id
    )
}

/// Write a new uniquely named key through a random member of `group`.
pub async fn put_random_key(
    ctx: &ClusterContext<'_>,
    group: &InstanceGroupRef,
    key_prefix: &str,
) -> Result<KvRecord> {
    let record = KvRecord {
        key: unique_key_name(key_prefix, &ctx.rng.unique_id()),
        value: PLACEHOLDER_VALUE.to_string(),
    };

    let address = resolve_member_address(ctx.cloud, ctx.rng, group).await?;
    let api = ctx.connector.connect(&address).await?;
    api.kv_put(&record.key, &record.value).await?;

    info!(key = %record.key, address = %address, "Wrote consul key");
    Ok(record)
}

/// Read `record.key` through a random member and require the same value.
pub async fn assert_key_present(
    ctx: &ClusterContext<'_>,
    group: &InstanceGroupRef,
    record: &KvRecord,
) -> Result<()> {
    let address = resolve_member_address(ctx.cloud, ctx.rng, group).await?;
    let api = ctx.connector.connect(&address).await?;

    match api.kv_get(&record.key).await? {
        None => Err(Error::KeyMissing {
            key: record.key.clone(),
        }),
        Some(actual) if actual != record.value => Err(Error::KeyValueMismatch {
            key: record.key.clone(),
            expected: record.value.clone(),
            actual,
        }),
        Some(_) => {
            info!(key = %record.key, address = %address, "Consul key survived");
            Ok(())
        }
    }
}

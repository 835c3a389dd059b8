use std::thread;
use std::time::Duration;

use anyhow::{Result, ensure};
use infocache::{Cache, ExpirationKind, Requestor, Timestamp};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

impl WorkloadsConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.workloads.is_empty(), "no workloads defined");
        for (i, workload) in self.workloads.iter().enumerate() {
            ensure!(workload.concurrency > 0, "workload {i}: concurrency must be positive");
            ensure!(workload.keys > 0, "workload {i}: needs at least one key");
            ensure!(
                (0.0..=1.0).contains(&workload.failure_rate),
                "workload {i}: failure_rate must be between 0 and 1"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Workload {
    /// How many units of work run at the same time.
    pub concurrency: usize,
    /// The number of distinct keys that are requested.
    pub keys: u64,
    /// How long a single fetch takes.
    #[serde(with = "humantime_serde", default = "default_fetch_time")]
    pub fetch_time: Duration,
    /// Probability of a fetch failing.
    #[serde(default)]
    pub failure_rate: f64,
    /// Whether loading a key also loads its partner key, `key ^ 1`.
    ///
    /// Partners load each other, so concurrent units of work regularly end up waiting on each
    /// other's entries.
    #[serde(default)]
    pub nested: bool,
}

fn default_fetch_time() -> Duration {
    Duration::from_millis(10)
}

/// What the stresstest stores in its caches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    pub key: u64,
    pub partner: Option<u64>,
    pub fetched_at: Timestamp,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("simulated upstream failure for key {0}")]
    Upstream(u64),
}

pub type RecordCache = Cache<u64, Record>;

/// Performs one unit of work: a fresh requestor loading a random key.
pub fn process_unit(cache: &RecordCache, workload: &Workload) -> Result<Record, FetchError> {
    let key = rand::rng().random_range(0..workload.keys);
    let mut requestor = cache.manager().requestor();
    load(cache, &mut requestor, workload, key, workload.nested)
}

fn load(
    cache: &RecordCache,
    requestor: &mut Requestor,
    workload: &Workload,
    key: u64,
    nested: bool,
) -> Result<Record, FetchError> {
    cache.get_or_load(requestor, key, |requestor| {
        let partner = if nested {
            Some(load(cache, requestor, workload, key ^ 1, false)?.key)
        } else {
            None
        };

        thread::sleep(workload.fetch_time);
        if rand::rng().random_bool(workload.failure_rate) {
            tracing::debug!(key, "Simulated fetch failure");
            return Err(FetchError::Upstream(key));
        }

        let record = Record {
            key,
            partner,
            fetched_at: requestor.request_time(),
        };
        let kind = match partner {
            Some(_) => ExpirationKind::Normal,
            None => ExpirationKind::Short,
        };
        Ok((record, requestor.new_expiration(kind)))
    })
}

//! Engine configuration types.
//!
//! These structures are shared across crates (config loading, the daemon, and
//! the engine itself) so they live in the model crate. Guard-rail validation
//! lives in `conduit-config`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Global knobs that tune the operation engine.
///
/// All fields carry defaults so deployments can supply partial
/// configuration payloads.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker slots and the standalone job queue.
    pub pool: PoolConfig,
    /// Timeouts, retention, and resumption cadence for operations.
    pub operations: OperationsConfig,
    /// Cascade delete tuning.
    pub cascade: CascadeConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of jobs allowed to execute at the same time.
    pub pool_size: usize,
    /// Capacity of the standalone worker pool queue. Submissions beyond it
    /// are rejected.
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 20,
            queue_capacity: 100,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OperationsConfig {
    /// Deadline for one job execution; also the stuck-operation sweep
    /// cadence and age threshold.
    pub job_timeout_secs: u64,
    /// Retention sweep cadence and age threshold.
    pub cleanup_interval_secs: u64,
    /// How long shutdown waits for in-flight jobs before abandoning them.
    pub shutdown_grace_secs: u64,
    /// Cadence of the sweep that resumes rescheduled and orphan-mitigating
    /// operations.
    pub reschedule_interval_secs: u64,
    /// Longest time an asynchronous backend action may be polled.
    pub max_polling_duration_secs: u64,
    /// Orphan mitigation is retried only this long after it was scheduled.
    pub orphan_mitigation_grace_secs: u64,
    /// Keep the newest operation of every resource during retention sweeps.
    pub keep_latest_per_resource: bool,
    /// How long a synchronous caller waits on an operation notification.
    pub notification_timeout_secs: u64,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            job_timeout_secs: 60 * 60,
            cleanup_interval_secs: 24 * 60 * 60,
            shutdown_grace_secs: 3,
            reschedule_interval_secs: 30,
            max_polling_duration_secs: 7 * 24 * 60 * 60,
            orphan_mitigation_grace_secs: 12 * 60 * 60,
            keep_latest_per_resource: false,
            notification_timeout_secs: 60,
        }
    }
}

impl OperationsConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn reschedule_interval(&self) -> Duration {
        Duration::from_secs(self.reschedule_interval_secs)
    }

    pub fn max_polling_duration(&self) -> Duration {
        Duration::from_secs(self.max_polling_duration_secs)
    }

    pub fn orphan_mitigation_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_mitigation_grace_secs)
    }

    pub fn notification_timeout(&self) -> Duration {
        Duration::from_secs(self.notification_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CascadeConfig {
    /// Cadence of the processor that advances pending cascade trees (ms).
    pub polling_interval_ms: u64,
    /// Label key that ties resources to a tenant.
    pub tenant_label_key: String,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            polling_interval_ms: 2_000,
            tenant_label_key: "tenant".to_string(),
        }
    }
}

impl CascadeConfig {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }
}

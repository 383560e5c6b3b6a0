//! Periodic upkeep of the operation table.
//!
//! * retention: operations older than the cleanup interval are deleted;
//! * stuck recovery: operations left IN_PROGRESS past the job timeout (for
//!   example after a crash) are removed;
//! * resumption: rescheduled and orphan-mitigating operations are handed to
//!   an [`OperationResumer`] so their job runs again.
//!
//! Each sweep runs on its own timer until shutdown. A failing sweep is logged
//! and retried on the next tick.

use std::{collections::HashMap, fmt, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_model::{Operation, OperationState, OperationsConfig};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{EngineError, Result},
    scope::Scope,
    store::{Criterion, ObjectType, OperationStore, Repository},
};

/// Re-submits an operation whose job has more work to do.
#[async_trait]
pub trait OperationResumer: Send + Sync {
    async fn resume(&self, scope: &Scope, operation: Operation) -> Result<()>;
}

pub struct OperationMaintainer {
    repo: Arc<dyn Repository>,
    config: OperationsConfig,
    resumer: Option<Arc<dyn OperationResumer>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl fmt::Debug for OperationMaintainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationMaintainer")
            .field("config", &self.config)
            .field("resumer", &self.resumer.as_ref().map(|_| "OperationResumer"))
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

impl OperationMaintainer {
    pub fn new(
        repo: Arc<dyn Repository>,
        config: OperationsConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            repo,
            config,
            resumer: None,
            handles: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    pub fn with_resumer(mut self, resumer: Arc<dyn OperationResumer>) -> Self {
        self.resumer = Some(resumer);
        self
    }

    /// Starts the periodic sweeps. The resumption sweep only runs when a
    /// resumer was supplied.
    pub async fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return;
        }
        handles.push(self.spawn_sweep(
            "retention",
            self.config.cleanup_interval(),
            |m| async move { m.cleanup_old_operations(Utc::now()).await },
        ));
        handles.push(self.spawn_sweep(
            "stuck",
            self.config.job_timeout(),
            |m| async move { m.cleanup_stuck_operations(Utc::now()).await },
        ));
        if self.resumer.is_some() {
            handles.push(self.spawn_sweep(
                "resume",
                self.config.reschedule_interval(),
                |m| async move { m.resume_operations(Utc::now()).await },
            ));
        }
        info!(target: "conduit::maintainer", sweeps = handles.len(), "maintainer started");
    }

    fn spawn_sweep<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        interval: Duration,
        sweep: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<usize>> + Send + 'static,
    {
        let this = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!(target: "conduit::maintainer", sweep = name, "sweep shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match sweep(Arc::clone(&this)).await {
                            Ok(count) => debug!(
                                target: "conduit::maintainer",
                                sweep = name,
                                count,
                                "sweep finished"
                            ),
                            Err(err) => warn!(
                                target: "conduit::maintainer",
                                sweep = name,
                                error = %err,
                                "sweep failed"
                            ),
                        }
                    }
                }
            }
        })
    }

    /// Deletes operations created before `now - cleanup_interval` and returns
    /// how many were removed. With `keep_latest_per_resource` the newest
    /// operation of each resource survives regardless of age.
    pub async fn cleanup_old_operations(&self, now: DateTime<Utc>) -> Result<usize> {
        let scope = Scope::from_token(self.shutdown.child_token());
        let threshold = now - chrono_duration(self.config.cleanup_interval());
        let older = Criterion::lt("created_at", threshold);

        let deleted = if self.config.keep_latest_per_resource {
            let latest = self.latest_per_resource(&scope).await?;
            let victims: Vec<String> = self
                .repo
                .list_operations(&scope, std::slice::from_ref(&older))
                .await?
                .into_iter()
                .filter(|op| latest.get(&op.resource_id) != Some(&op.id.to_string()))
                .map(|op| op.id.to_string())
                .collect();
            if victims.is_empty() {
                0
            } else {
                self.repo
                    .delete(
                        &scope,
                        ObjectType::Operation,
                        &[Criterion::is_in("id", victims)],
                    )
                    .await?
                    .len()
            }
        } else {
            self.repo
                .delete(&scope, ObjectType::Operation, &[older])
                .await?
                .len()
        };

        if deleted > 0 {
            info!(
                target: "conduit::maintainer",
                deleted,
                %threshold,
                "removed expired operations"
            );
        }
        Ok(deleted)
    }

    async fn latest_per_resource(&self, scope: &Scope) -> Result<HashMap<String, String>> {
        let mut latest: HashMap<String, (DateTime<Utc>, String)> = HashMap::new();
        for op in self.repo.list_operations(scope, &[]).await? {
            let entry = latest
                .entry(op.resource_id.clone())
                .or_insert((op.created_at, op.id.to_string()));
            if op.created_at > entry.0 {
                *entry = (op.created_at, op.id.to_string());
            }
        }
        Ok(latest.into_iter().map(|(k, (_, id))| (k, id)).collect())
    }

    /// Deletes operations that are still IN_PROGRESS although they were
    /// created before `now - job_timeout`; their owner is assumed gone.
    /// Operations waiting on an asynchronous backend action (`reschedule`
    /// set) are left to the resumption sweep.
    pub async fn cleanup_stuck_operations(&self, now: DateTime<Utc>) -> Result<usize> {
        let scope = Scope::from_token(self.shutdown.child_token());
        let threshold = now - chrono_duration(self.config.job_timeout());
        let removed = self
            .repo
            .delete(
                &scope,
                ObjectType::Operation,
                &[
                    Criterion::eq("state", OperationState::InProgress),
                    Criterion::eq("reschedule", false),
                    Criterion::lt("created_at", threshold),
                ],
            )
            .await?;

        for object in &removed {
            debug!(target: "conduit::maintainer", operation_id = %object.id(), "removed stuck operation");
        }
        if !removed.is_empty() {
            info!(
                target: "conduit::maintainer",
                removed = removed.len(),
                %threshold,
                "removed stuck operations"
            );
        }
        Ok(removed.len())
    }

    /// Hands resumable operations to the resumer and returns how many were
    /// accepted:
    ///
    /// * IN_PROGRESS with `reschedule` set, idle for a reschedule interval;
    /// * FAILED with `reschedule` set (a poll pass that timed out);
    /// * FAILED inside the orphan-mitigation window.
    pub async fn resume_operations(&self, now: DateTime<Utc>) -> Result<usize> {
        let Some(resumer) = &self.resumer else {
            return Ok(0);
        };
        let scope = Scope::from_token(self.shutdown.child_token());
        let idle_since = now - chrono_duration(self.config.reschedule_interval());
        let grace = chrono_duration(self.config.orphan_mitigation_grace());

        let mut candidates = self
            .repo
            .list_operations(
                &scope,
                &[
                    Criterion::eq("state", OperationState::InProgress),
                    Criterion::eq("reschedule", true),
                    Criterion::lt("updated_at", idle_since),
                ],
            )
            .await?;
        candidates.extend(
            self.repo
                .list_operations(&scope, &[Criterion::eq("state", OperationState::Failed)])
                .await?
                .into_iter()
                .filter(|op| {
                    op.reschedule
                        || (op.deletion_scheduled.is_some()
                            && op.in_orphan_mitigation_window(now, grace))
                }),
        );

        let mut resumed = 0;
        for op in candidates {
            let id = op.id;
            match resumer.resume(&scope, op).await {
                Ok(()) => resumed += 1,
                Err(EngineError::Busy(reason)) => {
                    debug!(target: "conduit::maintainer", operation_id = %id, %reason, "resume deferred");
                    break;
                }
                Err(EngineError::Conflict(reason)) => {
                    debug!(target: "conduit::maintainer", operation_id = %id, %reason, "operation still running");
                }
                Err(err) => {
                    warn!(target: "conduit::maintainer", operation_id = %id, error = %err, "failed to resume operation");
                }
            }
        }
        Ok(resumed)
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(target: "conduit::maintainer", "sweep task failed: {err:?}");
            }
        }
    }
}

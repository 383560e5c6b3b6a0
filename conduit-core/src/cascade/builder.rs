use std::{collections::BTreeSet, fmt, sync::Arc};

use conduit_model::{
    Broker, Operation, OperationCategory, OperationId, OperationState, Resource,
    ResourceType, ServiceOffering, ServicePlan,
};
use futures::{FutureExt, future::BoxFuture};
use tracing::{debug, warn};

use super::criteria::{CascadeResource, ChildrenMap};
use crate::{
    catalog::BrokerCatalog,
    error::{EngineError, Result},
    scope::Scope,
    store::{Criterion, Order, OperationStore, Repository},
};

/// What the builder does with a descendant that already has a delete
/// operation under the same cascade root.
#[derive(Clone, Debug, PartialEq)]
enum Existing {
    None,
    /// Still running or mitigating: leave it and its subtree alone.
    Skip(Operation),
    /// Finished: record its outcome in the new tree without redoing it.
    Reuse(Operation),
}

/// Expands a cascade root into one DELETE operation per descendant.
pub struct CascadeTreeBuilder {
    repo: Arc<dyn Repository>,
}

impl fmt::Debug for CascadeTreeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CascadeTreeBuilder")
            .field("repo", &"Repository")
            .finish()
    }
}

impl CascadeTreeBuilder {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    /// Builds the operations below `root_op`, parents before children. The
    /// result is not persisted.
    pub async fn build(
        &self,
        scope: &Scope,
        root_op: &Operation,
        root: Resource,
    ) -> Result<Vec<Operation>> {
        let root_id = root_op.cascade_root_id.ok_or_else(|| {
            EngineError::Validation(format!(
                "operation {} is not part of a cascade",
                root_op.id
            ))
        })?;
        let mut out = Vec::new();
        self.descend(scope, root_op, root, root_id, &mut out).await?;
        debug!(
            target: "conduit::cascade",
            %root_id,
            resource_type = %root_op.resource_type,
            resource_id = %root_op.resource_id,
            operations = out.len(),
            "cascade tree built"
        );
        Ok(out)
    }

    fn descend<'a>(
        &'a self,
        scope: &'a Scope,
        parent_op: &'a Operation,
        parent: Resource,
        root_id: OperationId,
        out: &'a mut Vec<Operation>,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let mut parent = parent;
            if let Resource::Broker(broker) = &mut parent {
                self.attach_catalog(scope, broker).await?;
            }

            let mut children = self.resolve_children(scope, &parent).await?;
            if let Resource::Broker(broker) = &parent {
                hydrate_offerings(&mut children, broker);
            }
            if let Some(cleaner) = parent.duplicates_cleaner() {
                cleaner.clean_duplicates(&mut children);
            }

            for (_, resources) in children {
                for child in resources {
                    match self.existing(scope, &child, root_id).await? {
                        Existing::Skip(existing) => {
                            debug!(
                                target: "conduit::cascade",
                                operation_id = %existing.id,
                                resource_type = %child.resource_type(),
                                resource_id = %child.id(),
                                "delete already running; skipping subtree"
                            );
                        }
                        Existing::Reuse(existing) => {
                            let mut op = child_operation(parent_op, &child, root_id);
                            op.state = existing.state;
                            op.errors = existing.errors.clone();
                            out.push(op);
                        }
                        Existing::None => {
                            let op = child_operation(parent_op, &child, root_id);
                            out.push(op.clone());
                            self.descend(scope, &op, child, root_id, out).await?;
                        }
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    async fn resolve_children(
        &self,
        scope: &Scope,
        parent: &Resource,
    ) -> Result<ChildrenMap> {
        let mut children = ChildrenMap::new();
        for (kind, alternatives) in parent.children_criterion() {
            let mut found: Vec<Resource> = Vec::new();
            for criteria in alternatives {
                for resource in self.repo.list_resources(scope, kind, &criteria).await? {
                    if !found.iter().any(|r| r.id() == resource.id()) {
                        found.push(resource);
                    }
                }
            }
            if !found.is_empty() {
                children.insert(kind, found);
            }
        }
        Ok(children)
    }

    /// Loads the broker's offerings and, for each, the plans its catalog
    /// entry lists.
    async fn attach_catalog(&self, scope: &Scope, broker: &mut Broker) -> Result<()> {
        let mut offerings: Vec<ServiceOffering> = self
            .repo
            .list_resources(
                scope,
                ResourceType::Offering,
                &[Criterion::eq("broker_id", broker.id.as_str())],
            )
            .await?
            .into_iter()
            .filter_map(|r| match r {
                Resource::Offering(o) => Some(o),
                _ => None,
            })
            .collect();

        let plans: Vec<ServicePlan> = self
            .repo
            .list_resources(
                scope,
                ResourceType::Plan,
                &[Criterion::is_in(
                    "service_offering_id",
                    offerings.iter().map(|o| o.id.as_str()),
                )],
            )
            .await?
            .into_iter()
            .filter_map(|r| match r {
                Resource::Plan(p) => Some(p),
                _ => None,
            })
            .collect();

        let catalog = match BrokerCatalog::parse(&broker.catalog) {
            Ok(catalog) => Some(catalog),
            Err(err) => {
                warn!(
                    target: "conduit::cascade",
                    broker_id = %broker.id,
                    error = %err,
                    "unreadable broker catalog; attaching plans by offering"
                );
                None
            }
        };

        for offering in &mut offerings {
            let listed: Option<BTreeSet<&str>> = catalog
                .as_ref()
                .and_then(|c| c.service(&offering.catalog_id))
                .map(|service| service.plan_ids().collect());
            let attached = plans
                .iter()
                .filter(|plan| match &listed {
                    Some(ids) => ids.contains(plan.catalog_id.as_str()),
                    None => plan.service_offering_id == offering.id,
                })
                .cloned()
                .collect();
            offering.plans = Some(attached);
        }
        broker.services = offerings;
        Ok(())
    }

    async fn existing(
        &self,
        scope: &Scope,
        child: &Resource,
        root_id: OperationId,
    ) -> Result<Existing> {
        let latest = self
            .repo
            .list_operations(
                scope,
                &[
                    Criterion::eq("resource_id", child.id()),
                    Criterion::eq("resource_type", child.resource_type()),
                    Criterion::eq("type", OperationCategory::Delete),
                    Criterion::eq("cascade_root_id", root_id),
                    Criterion::order_by("updated_at", Order::Desc),
                    Criterion::limit(1),
                ],
            )
            .await?
            .into_iter()
            .next();

        Ok(match latest {
            None => Existing::None,
            Some(op) if op.state == OperationState::InProgress || op.in_orphan_mitigation() => {
                Existing::Skip(op)
            }
            Some(op) if op.is_terminal() => Existing::Reuse(op),
            Some(_) => Existing::None,
        })
    }
}

/// Swaps store-listed offerings for the copies carrying their attached plans.
fn hydrate_offerings(children: &mut ChildrenMap, broker: &Broker) {
    let Some(offerings) = children.get_mut(&ResourceType::Offering) else {
        return;
    };
    for resource in offerings.iter_mut() {
        if let Resource::Offering(offering) = resource
            && let Some(loaded) = broker.services.iter().find(|s| s.id == offering.id)
        {
            *offering = loaded.clone();
        }
    }
}

fn child_operation(parent_op: &Operation, child: &Resource, root_id: OperationId) -> Operation {
    let mut op = Operation::new(child.id(), child.resource_type(), OperationCategory::Delete);
    op.parent_id = Some(parent_op.id);
    op.cascade_root_id = Some(root_id);
    op.correlation_id = parent_op.correlation_id.clone();
    op.platform_id = parent_op.platform_id.clone();
    op.labels = parent_op.labels.clone();
    op
}

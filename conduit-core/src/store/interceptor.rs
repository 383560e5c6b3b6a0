//! Per-type repository hooks.
//!
//! [`InterceptableRepository`] wraps another repository and runs every
//! registered [`RepositoryInterceptor`] around writes to the interceptor's
//! object type. Hooks receive the wrapped repository, so writes they make are
//! not intercepted again.

use std::{collections::BTreeSet, fmt, sync::Arc};

use async_trait::async_trait;
use conduit_model::{
    Broker, OperationCategory, Resource, ResourceType, ServiceOffering,
    ServicePlan, TransitiveResource,
};
use tracing::debug;
use uuid::Uuid;

use super::{Criterion, Object, ObjectType, OperationStore, Repository};
use crate::{catalog::BrokerCatalog, error::Result, scope::Scope};

#[async_trait]
pub trait RepositoryInterceptor: Send + Sync {
    fn name(&self) -> &'static str;

    fn object_type(&self) -> ObjectType;

    async fn before_create(
        &self,
        _scope: &Scope,
        _repo: &dyn Repository,
        _object: &mut Object,
    ) -> Result<()> {
        Ok(())
    }

    async fn after_create(
        &self,
        _scope: &Scope,
        _repo: &dyn Repository,
        _object: &Object,
    ) -> Result<()> {
        Ok(())
    }

    async fn after_update(
        &self,
        _scope: &Scope,
        _repo: &dyn Repository,
        _old: &Object,
        _new: &Object,
    ) -> Result<()> {
        Ok(())
    }

    async fn after_delete(
        &self,
        _scope: &Scope,
        _repo: &dyn Repository,
        _deleted: &[Object],
    ) -> Result<()> {
        Ok(())
    }
}

pub struct InterceptableRepository {
    inner: Arc<dyn Repository>,
    interceptors: Vec<Arc<dyn RepositoryInterceptor>>,
}

impl fmt::Debug for InterceptableRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.interceptors.iter().map(|i| i.name()).collect();
        f.debug_struct("InterceptableRepository")
            .field("interceptors", &names)
            .finish()
    }
}

impl InterceptableRepository {
    pub fn new(inner: Arc<dyn Repository>) -> Self {
        Self {
            inner,
            interceptors: Vec::new(),
        }
    }

    pub fn with_interceptor(
        mut self,
        interceptor: Arc<dyn RepositoryInterceptor>,
    ) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    fn for_type(
        &self,
        object_type: ObjectType,
    ) -> impl Iterator<Item = &Arc<dyn RepositoryInterceptor>> {
        self.interceptors
            .iter()
            .filter(move |i| i.object_type() == object_type)
    }
}

#[async_trait]
impl Repository for InterceptableRepository {
    async fn create(&self, scope: &Scope, object: Object) -> Result<Object> {
        let mut object = object;
        let object_type = object.object_type();
        for interceptor in self.for_type(object_type) {
            interceptor
                .before_create(scope, self.inner.as_ref(), &mut object)
                .await?;
        }
        let created = self.inner.create(scope, object).await?;
        for interceptor in self.for_type(object_type) {
            interceptor
                .after_create(scope, self.inner.as_ref(), &created)
                .await?;
        }
        Ok(created)
    }

    async fn update(&self, scope: &Scope, object: Object) -> Result<Object> {
        let object_type = object.object_type();
        if self.for_type(object_type).next().is_none() {
            return self.inner.update(scope, object).await;
        }
        let old = self.inner.get(scope, object_type, &object.id()).await?;
        let updated = self.inner.update(scope, object).await?;
        for interceptor in self.for_type(object_type) {
            interceptor
                .after_update(scope, self.inner.as_ref(), &old, &updated)
                .await?;
        }
        Ok(updated)
    }

    async fn delete(
        &self,
        scope: &Scope,
        object_type: ObjectType,
        criteria: &[Criterion],
    ) -> Result<Vec<Object>> {
        let deleted = self.inner.delete(scope, object_type, criteria).await?;
        if !deleted.is_empty() {
            for interceptor in self.for_type(object_type) {
                interceptor
                    .after_delete(scope, self.inner.as_ref(), &deleted)
                    .await?;
            }
        }
        Ok(deleted)
    }

    async fn get(
        &self,
        scope: &Scope,
        object_type: ObjectType,
        id: &str,
    ) -> Result<Object> {
        self.inner.get(scope, object_type, id).await
    }

    async fn list(
        &self,
        scope: &Scope,
        object_type: ObjectType,
        criteria: &[Criterion],
    ) -> Result<Vec<Object>> {
        self.inner.list(scope, object_type, criteria).await
    }
}

/// Keeps offerings and plans in step with a broker's catalog whenever the
/// broker is written as part of an operation. Every offering or plan created
/// or removed is recorded as a transitive resource of that operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct CatalogInterceptor;

impl CatalogInterceptor {
    async fn sync(
        &self,
        scope: &Scope,
        repo: &dyn Repository,
        broker: &Broker,
    ) -> Result<()> {
        let catalog = BrokerCatalog::parse(&broker.catalog)?;
        let mut offerings: Vec<ServiceOffering> = repo
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

        let advertised: BTreeSet<&str> =
            catalog.services.iter().map(|s| s.id.as_str()).collect();

        for stale in offerings
            .iter()
            .filter(|o| !advertised.contains(o.catalog_id.as_str()))
        {
            let plans = repo
                .delete(
                    scope,
                    ResourceType::Plan.into(),
                    &[Criterion::eq("service_offering_id", stale.id.as_str())],
                )
                .await?;
            if !plans.is_empty() {
                record(scope, ResourceType::Plan, OperationCategory::Delete).await;
            }
            repo.delete(
                scope,
                ResourceType::Offering.into(),
                &[Criterion::eq("id", stale.id.as_str())],
            )
            .await?;
            record(scope, ResourceType::Offering, OperationCategory::Delete).await;
        }
        offerings.retain(|o| advertised.contains(o.catalog_id.as_str()));

        for service in &catalog.services {
            if offerings.iter().any(|o| o.catalog_id == service.id) {
                continue;
            }
            let mut offering = ServiceOffering::new(
                Uuid::new_v4().to_string(),
                service.id.as_str(),
                broker.id.as_str(),
            );
            if !service.name.is_empty() {
                offering.name = service.name.clone();
            }
            repo.create(scope, Resource::Offering(offering.clone()).into())
                .await?;
            record(scope, ResourceType::Offering, OperationCategory::Create).await;
            offerings.push(offering);
        }

        let offering_ids: Vec<&str> =
            offerings.iter().map(|o| o.id.as_str()).collect();
        let mut plans: Vec<ServicePlan> = repo
            .list_resources(
                scope,
                ResourceType::Plan,
                &[Criterion::is_in("service_offering_id", offering_ids)],
            )
            .await?
            .into_iter()
            .filter_map(|r| match r {
                Resource::Plan(p) => Some(p),
                _ => None,
            })
            .collect();

        let wanted = catalog.plan_ids();
        let stale_plans: Vec<String> = plans
            .iter()
            .filter(|p| !wanted.contains(p.catalog_id.as_str()))
            .map(|p| p.id.clone())
            .collect();
        if !stale_plans.is_empty() {
            repo.delete(
                scope,
                ResourceType::Plan.into(),
                &[Criterion::is_in("id", stale_plans.iter())],
            )
            .await?;
            record(scope, ResourceType::Plan, OperationCategory::Delete).await;
            plans.retain(|p| !stale_plans.contains(&p.id));
        }

        for service in &catalog.services {
            let Some(offering) =
                offerings.iter().find(|o| o.catalog_id == service.id)
            else {
                continue;
            };
            for entry in &service.plans {
                // A plan listed under several services is stored once.
                if plans.iter().any(|p| p.catalog_id == entry.id) {
                    continue;
                }
                let mut plan = ServicePlan::new(
                    Uuid::new_v4().to_string(),
                    entry.id.as_str(),
                    offering.id.as_str(),
                );
                if !entry.name.is_empty() {
                    plan.name = entry.name.clone();
                }
                repo.create(scope, Resource::Plan(plan.clone()).into())
                    .await?;
                record(scope, ResourceType::Plan, OperationCategory::Create).await;
                plans.push(plan);
            }
        }

        debug!(
            broker_id = %broker.id,
            offerings = offerings.len(),
            plans = plans.len(),
            "catalog synchronised"
        );
        Ok(())
    }
}

async fn record(
    scope: &Scope,
    resource_type: ResourceType,
    operation_type: OperationCategory,
) {
    scope
        .record_transitive(TransitiveResource {
            resource_type,
            operation_type,
        })
        .await;
}

fn as_broker(object: &Object) -> Option<&Broker> {
    match object.as_resource() {
        Some(Resource::Broker(broker)) => Some(broker),
        _ => None,
    }
}

#[async_trait]
impl RepositoryInterceptor for CatalogInterceptor {
    fn name(&self) -> &'static str {
        "catalog"
    }

    fn object_type(&self) -> ObjectType {
        ResourceType::Broker.into()
    }

    async fn after_create(
        &self,
        scope: &Scope,
        repo: &dyn Repository,
        object: &Object,
    ) -> Result<()> {
        if scope.operation().is_none() {
            return Ok(());
        }
        match as_broker(object) {
            Some(broker) => self.sync(scope, repo, broker).await,
            None => Ok(()),
        }
    }

    async fn after_update(
        &self,
        scope: &Scope,
        repo: &dyn Repository,
        old: &Object,
        new: &Object,
    ) -> Result<()> {
        if scope.operation().is_none() {
            return Ok(());
        }
        match (as_broker(old), as_broker(new)) {
            (Some(before), Some(after)) if before.catalog != after.catalog => {
                self.sync(scope, repo, after).await
            }
            _ => Ok(()),
        }
    }
}

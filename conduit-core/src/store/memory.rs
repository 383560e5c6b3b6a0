use std::{
    cmp::Ordering,
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering as AtomicOrdering},
};

use async_trait::async_trait;
use chrono::Utc;
use conduit_model::ResourceType;
use tokio::sync::RwLock;
use tracing::trace;

use super::{Criterion, Object, ObjectType, Order, Queryable, Repository};
use crate::{
    error::{EngineError, Result},
    scope::Scope,
};

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    object: Object,
}

/// Process-local repository. Records of each type are kept in insertion
/// order; listings return them in that order unless ordered explicitly.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    tables: RwLock<HashMap<ObjectType, HashMap<String, Entry>>>,
    seq: AtomicU64,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records of `object_type`, bypassing scopes. Test helper.
    pub async fn count(&self, object_type: ObjectType) -> usize {
        self.tables
            .read()
            .await
            .get(&object_type)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    fn filter(
        rows: impl Iterator<Item = Entry>,
        criteria: &[Criterion],
    ) -> Result<Vec<Entry>> {
        let mut out = Vec::new();
        for entry in rows {
            let mut keep = true;
            for criterion in criteria.iter().filter(|c| c.is_filter()) {
                if !criterion
                    .matches(&entry.object)
                    .map_err(EngineError::Validation)?
                {
                    keep = false;
                    break;
                }
            }
            if keep {
                out.push(entry);
            }
        }
        Ok(out)
    }

    fn window(mut rows: Vec<Entry>, criteria: &[Criterion]) -> Vec<Object> {
        rows.sort_by_key(|e| e.seq);
        for criterion in criteria {
            if let Criterion::OrderBy { field, order } = criterion {
                rows.sort_by(|a, b| {
                    let ord = match (a.object.field(field), b.object.field(field))
                    {
                        (Some(x), Some(y)) => compare(&x, &y),
                        _ => Ordering::Equal,
                    };
                    match order {
                        Order::Asc => ord,
                        Order::Desc => ord.reverse(),
                    }
                });
            }
        }
        let limit = criteria.iter().find_map(|c| match c {
            Criterion::Limit(n) => Some(*n),
            _ => None,
        });
        let iter = rows.into_iter().map(|e| e.object);
        match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        }
    }
}

fn compare(a: &super::FieldValue, b: &super::FieldValue) -> Ordering {
    use super::FieldValue::*;
    match (a, b) {
        (Str(x), Str(y)) => x.cmp(y),
        (Int(x), Int(y)) => x.cmp(y),
        (Bool(x), Bool(y)) => x.cmp(y),
        (Time(x), Time(y)) => x.cmp(y),
        (Null, Null) => Ordering::Equal,
        (Null, _) => Ordering::Less,
        (_, Null) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

fn is_virtual(object_type: ObjectType) -> bool {
    object_type == ObjectType::Resource(ResourceType::Tenant)
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn create(&self, scope: &Scope, object: Object) -> Result<Object> {
        scope.ensure_active()?;
        let object_type = object.object_type();
        if is_virtual(object_type) {
            return Err(EngineError::Validation(
                "tenants are not stored".to_string(),
            ));
        }
        let id = object.id();
        let mut tables = self.tables.write().await;
        let table = tables.entry(object_type).or_default();
        if table.contains_key(&id) {
            return Err(EngineError::Conflict(format!(
                "{object_type} {id} already exists"
            )));
        }
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        table.insert(
            id.clone(),
            Entry {
                seq,
                object: object.clone(),
            },
        );
        trace!(%object_type, %id, "created record");
        Ok(object)
    }

    async fn update(&self, scope: &Scope, object: Object) -> Result<Object> {
        scope.ensure_active()?;
        let object_type = object.object_type();
        let id = object.id();
        let mut tables = self.tables.write().await;
        let entry = tables
            .get_mut(&object_type)
            .and_then(|table| table.get_mut(&id))
            .ok_or_else(|| {
                EngineError::NotFound(format!("{object_type} {id}"))
            })?;
        let mut object = object;
        if let Object::Resource(_) = object {
            object.touch(Utc::now());
        }
        entry.object = object.clone();
        trace!(%object_type, %id, "updated record");
        Ok(object)
    }

    async fn delete(
        &self,
        scope: &Scope,
        object_type: ObjectType,
        criteria: &[Criterion],
    ) -> Result<Vec<Object>> {
        scope.ensure_active()?;
        let mut tables = self.tables.write().await;
        let Some(table) = tables.get_mut(&object_type) else {
            return Ok(Vec::new());
        };
        let matched = Self::filter(table.values().cloned(), criteria)?;
        let deleted = Self::window(matched, criteria);
        for object in &deleted {
            table.remove(&object.id());
        }
        trace!(%object_type, count = deleted.len(), "deleted records");
        Ok(deleted)
    }

    async fn get(
        &self,
        scope: &Scope,
        object_type: ObjectType,
        id: &str,
    ) -> Result<Object> {
        scope.ensure_active()?;
        self.tables
            .read()
            .await
            .get(&object_type)
            .and_then(|table| table.get(id))
            .map(|entry| entry.object.clone())
            .ok_or_else(|| EngineError::NotFound(format!("{object_type} {id}")))
    }

    async fn list(
        &self,
        scope: &Scope,
        object_type: ObjectType,
        criteria: &[Criterion],
    ) -> Result<Vec<Object>> {
        scope.ensure_active()?;
        let tables = self.tables.read().await;
        let Some(table) = tables.get(&object_type) else {
            return Ok(Vec::new());
        };
        let matched = Self::filter(table.values().cloned(), criteria)?;
        Ok(Self::window(matched, criteria))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::OperationStore;
    use conduit_model::{
        Operation, OperationCategory, Resource, ServicePlan, Tenant,
    };

    fn plan(id: &str, offering: &str) -> Object {
        Object::Resource(Resource::Plan(ServicePlan::new(id, id, offering)))
    }

    #[tokio::test]
    async fn create_conflicts_and_update_requires_existing() {
        let repo = InMemoryRepository::new();
        let scope = Scope::root();
        repo.create(&scope, plan("p1", "o1")).await.unwrap();

        let err = repo.create(&scope, plan("p1", "o1")).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)), "got {err:?}");

        let err = repo.update(&scope, plan("p2", "o1")).await.unwrap_err();
        assert!(err.is_not_found(), "got {err:?}");
    }

    #[tokio::test]
    async fn list_filters_orders_and_limits() {
        let repo = InMemoryRepository::new();
        let scope = Scope::root();
        for (id, offering) in [("p1", "o1"), ("p2", "o2"), ("p3", "o1")] {
            repo.create(&scope, plan(id, offering)).await.unwrap();
        }

        let ids: Vec<String> = repo
            .list(
                &scope,
                ResourceType::Plan.into(),
                &[Criterion::eq("service_offering_id", "o1")],
            )
            .await
            .unwrap()
            .iter()
            .map(Object::id)
            .collect();
        assert_eq!(ids, vec!["p1", "p3"]);

        let newest = repo
            .list(
                &scope,
                ResourceType::Plan.into(),
                &[Criterion::order_by("id", Order::Desc), Criterion::limit(1)],
            )
            .await
            .unwrap();
        assert_eq!(newest.len(), 1);
        assert_eq!(newest[0].id(), "p3");
    }

    #[tokio::test]
    async fn delete_by_criteria_returns_removed_records() {
        let repo = InMemoryRepository::new();
        let scope = Scope::root();
        let op = Operation::new(
            "i1",
            ResourceType::Instance,
            OperationCategory::Create,
        );
        repo.create_operation(&scope, op.clone()).await.unwrap();

        let removed = repo
            .delete(
                &scope,
                ObjectType::Operation,
                &[Criterion::eq("resource_id", "i1")],
            )
            .await
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(repo.count(ObjectType::Operation).await, 0);

        let nothing = repo
            .delete(&scope, ObjectType::Operation, &[])
            .await
            .unwrap();
        assert!(nothing.is_empty());
    }

    #[tokio::test]
    async fn cancelled_scope_is_refused() {
        let repo = InMemoryRepository::new();
        let scope = Scope::root();
        scope.cancel();
        let err = repo.create(&scope, plan("p1", "o1")).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn tenants_are_virtual() {
        let repo = InMemoryRepository::new();
        let scope = Scope::root();
        let tenant = Object::Resource(Resource::Tenant(Tenant::new("acme", "tenant")));
        assert!(repo.create(&scope, tenant).await.is_err());
        assert!(
            repo.list(&scope, ResourceType::Tenant.into(), &[])
                .await
                .unwrap()
                .is_empty()
        );
    }
}

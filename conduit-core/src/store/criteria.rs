//! Query criteria understood by every [`Repository`](super::Repository).

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use conduit_model::{
    Labels, Operation, OperationCategory, OperationId, OperationState,
    Resource, ResourceType,
};

/// Scalar value a criterion compares against.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Null,
    Str(String),
    Int(i64),
    Bool(bool),
    Time(DateTime<Utc>),
}

impl FieldValue {
    fn compare(&self, other: &FieldValue) -> Option<Ordering> {
        match (self, other) {
            (FieldValue::Null, FieldValue::Null) => Some(Ordering::Equal),
            (FieldValue::Str(a), FieldValue::Str(b)) => Some(a.cmp(b)),
            (FieldValue::Int(a), FieldValue::Int(b)) => Some(a.cmp(b)),
            (FieldValue::Bool(a), FieldValue::Bool(b)) => Some(a.cmp(b)),
            (FieldValue::Time(a), FieldValue::Time(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Str(value)
    }
}

impl From<&String> for FieldValue {
    fn from(value: &String) -> Self {
        FieldValue::Str(value.clone())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::Time(value)
    }
}

impl From<OperationId> for FieldValue {
    fn from(value: OperationId) -> Self {
        FieldValue::Str(value.to_string())
    }
}

impl From<ResourceType> for FieldValue {
    fn from(value: ResourceType) -> Self {
        FieldValue::Str(value.as_str().to_string())
    }
}

impl From<OperationState> for FieldValue {
    fn from(value: OperationState) -> Self {
        FieldValue::Str(value.as_str().to_string())
    }
}

impl From<OperationCategory> for FieldValue {
    fn from(value: OperationCategory) -> Self {
        FieldValue::Str(value.as_str().to_string())
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    Eq,
    NotEq,
    Lt,
    Gt,
    In,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Criterion {
    Field {
        name: String,
        op: Operator,
        values: Vec<FieldValue>,
    },
    /// Matches when the label `key` carries any of `values`.
    Label { key: String, values: Vec<String> },
    OrderBy { field: String, order: Order },
    Limit(usize),
}

impl Criterion {
    fn field(name: &str, op: Operator, values: Vec<FieldValue>) -> Self {
        Criterion::Field {
            name: name.to_string(),
            op,
            values,
        }
    }

    pub fn eq(name: &str, value: impl Into<FieldValue>) -> Self {
        Self::field(name, Operator::Eq, vec![value.into()])
    }

    pub fn not_eq(name: &str, value: impl Into<FieldValue>) -> Self {
        Self::field(name, Operator::NotEq, vec![value.into()])
    }

    pub fn lt(name: &str, value: impl Into<FieldValue>) -> Self {
        Self::field(name, Operator::Lt, vec![value.into()])
    }

    pub fn gt(name: &str, value: impl Into<FieldValue>) -> Self {
        Self::field(name, Operator::Gt, vec![value.into()])
    }

    pub fn is_in<I, V>(name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<FieldValue>,
    {
        Self::field(
            name,
            Operator::In,
            values.into_iter().map(Into::into).collect(),
        )
    }

    pub fn label_in<I, V>(key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        Criterion::Label {
            key: key.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn order_by(field: &str, order: Order) -> Self {
        Criterion::OrderBy {
            field: field.to_string(),
            order,
        }
    }

    pub fn limit(limit: usize) -> Self {
        Criterion::Limit(limit)
    }

    pub fn is_filter(&self) -> bool {
        matches!(self, Criterion::Field { .. } | Criterion::Label { .. })
    }

    /// Evaluates a filter criterion. Window criteria (ordering, limit) always
    /// match. Errors name the field when the object does not expose it.
    pub fn matches(&self, object: &dyn Queryable) -> Result<bool, String> {
        match self {
            Criterion::Field { name, op, values } => {
                let actual = object
                    .field(name)
                    .ok_or_else(|| format!("unknown field '{name}'"))?;
                Ok(match op {
                    Operator::Eq => values.first() == Some(&actual),
                    Operator::NotEq => values.first() != Some(&actual),
                    Operator::In => values.contains(&actual),
                    Operator::Lt => values.first().and_then(|v| actual.compare(v))
                        == Some(Ordering::Less),
                    Operator::Gt => values.first().and_then(|v| actual.compare(v))
                        == Some(Ordering::Greater),
                })
            }
            Criterion::Label { key, values } => Ok(object
                .labels()
                .get(key)
                .is_some_and(|carried| carried.iter().any(|v| values.contains(v)))),
            Criterion::OrderBy { .. } | Criterion::Limit(_) => Ok(true),
        }
    }
}

/// Exposes named fields of a stored object to criteria evaluation.
pub trait Queryable {
    /// `None` means the object has no such field; unset optional fields are
    /// reported as [`FieldValue::Null`].
    fn field(&self, name: &str) -> Option<FieldValue>;
    fn labels(&self) -> &Labels;
}

impl Queryable for Operation {
    fn field(&self, name: &str) -> Option<FieldValue> {
        let value = match name {
            "id" => self.id.into(),
            "resource_id" => self.resource_id.as_str().into(),
            "resource_type" => self.resource_type.into(),
            "type" => self.category.into(),
            "state" => self.state.into(),
            "reschedule" => self.reschedule.into(),
            "reschedule_timestamp" => self.reschedule_timestamp.into(),
            "external_id" => self.external_id.clone().into(),
            "is_async" => self.is_async.into(),
            "deletion_scheduled" => self.deletion_scheduled.into(),
            "parent_id" => self.parent_id.into(),
            "cascade_root_id" => self.cascade_root_id.into(),
            "correlation_id" => self.correlation_id.clone().into(),
            "platform_id" => self.platform_id.clone().into(),
            "created_at" => self.created_at.into(),
            "updated_at" => self.updated_at.into(),
            _ => return None,
        };
        Some(value)
    }

    fn labels(&self) -> &Labels {
        &self.labels
    }
}

impl Queryable for Resource {
    fn field(&self, name: &str) -> Option<FieldValue> {
        match name {
            "id" => return Some(self.id().into()),
            "created_at" => return Some(self.created_at().into()),
            "updated_at" => return Some(self.updated_at().into()),
            _ => {}
        }
        let value = match (self, name) {
            (Resource::Broker(b), "name") => b.name.as_str().into(),
            (Resource::Broker(b), "broker_url") => b.broker_url.as_str().into(),
            (Resource::Offering(o), "name") => o.name.as_str().into(),
            (Resource::Offering(o), "catalog_id") => o.catalog_id.as_str().into(),
            (Resource::Offering(o), "broker_id") => o.broker_id.as_str().into(),
            (Resource::Plan(p), "name") => p.name.as_str().into(),
            (Resource::Plan(p), "catalog_id") => p.catalog_id.as_str().into(),
            (Resource::Plan(p), "service_offering_id") => {
                p.service_offering_id.as_str().into()
            }
            (Resource::Visibility(v), "service_plan_id") => {
                v.service_plan_id.as_str().into()
            }
            (Resource::Visibility(v), "platform_id") => {
                v.platform_id.clone().into()
            }
            (Resource::Instance(i), "name") => i.name.as_str().into(),
            (Resource::Instance(i), "service_plan_id") => {
                i.service_plan_id.as_str().into()
            }
            (Resource::Instance(i), "platform_id") => {
                i.platform_id.as_str().into()
            }
            (Resource::Instance(i), "ready") => i.ready.into(),
            (Resource::Instance(i), "usable") => i.usable.into(),
            (Resource::Instance(i), "dashboard_url") => {
                i.dashboard_url.clone().into()
            }
            (Resource::Binding(b), "name") => b.name.as_str().into(),
            (Resource::Binding(b), "service_instance_id") => {
                b.service_instance_id.as_str().into()
            }
            (Resource::Binding(b), "ready") => b.ready.into(),
            (Resource::Platform(p), "name") => p.name.as_str().into(),
            (Resource::Platform(p), "type") => p.platform_type.as_str().into(),
            _ => return None,
        };
        Some(value)
    }

    fn labels(&self) -> &Labels {
        Resource::labels(self)
    }
}

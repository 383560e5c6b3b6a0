use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

use crate::error::ModelError;

/// Label set attached to resources and operations. Each key may carry
/// several values.
pub type Labels = BTreeMap<String, Vec<String>>;

/// Closed set of resource kinds managed by the control plane.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Broker,
    Offering,
    Plan,
    Visibility,
    Instance,
    Binding,
    Platform,
    Tenant,
}

impl ResourceType {
    pub fn all() -> &'static [Self] {
        &[
            ResourceType::Broker,
            ResourceType::Offering,
            ResourceType::Plan,
            ResourceType::Visibility,
            ResourceType::Instance,
            ResourceType::Binding,
            ResourceType::Platform,
            ResourceType::Tenant,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Broker => "broker",
            ResourceType::Offering => "offering",
            ResourceType::Plan => "plan",
            ResourceType::Visibility => "visibility",
            ResourceType::Instance => "instance",
            ResourceType::Binding => "binding",
            ResourceType::Platform => "platform",
            ResourceType::Tenant => "tenant",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceType::all()
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ModelError::UnknownResourceType(s.to_string()))
    }
}

/// A registered service broker. `catalog` is the raw catalog document the
/// broker advertised; `services` is filled in memory when offerings and plans
/// are loaded alongside the broker and is never persisted.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Broker {
    pub id: String,
    pub name: String,
    pub broker_url: String,
    #[serde(default)]
    pub catalog: serde_json::Value,
    #[serde(default)]
    pub labels: Labels,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub services: Vec<ServiceOffering>,
}

impl Broker {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        catalog: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            broker_url: String::new(),
            catalog,
            labels: Labels::new(),
            created_at: now,
            updated_at: now,
            services: Vec::new(),
        }
    }
}

/// Service offering advertised in a broker catalog.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceOffering {
    pub id: String,
    pub name: String,
    pub catalog_id: String,
    pub broker_id: String,
    #[serde(default)]
    pub labels: Labels,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// `Some` once the plans were loaded alongside the offering.
    #[serde(skip)]
    pub plans: Option<Vec<ServicePlan>>,
}

impl ServiceOffering {
    pub fn new(
        id: impl Into<String>,
        catalog_id: impl Into<String>,
        broker_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let catalog_id = catalog_id.into();
        Self {
            id: id.into(),
            name: catalog_id.clone(),
            catalog_id,
            broker_id: broker_id.into(),
            labels: Labels::new(),
            created_at: now,
            updated_at: now,
            plans: None,
        }
    }
}

/// Service plan belonging to an offering.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServicePlan {
    pub id: String,
    pub name: String,
    pub catalog_id: String,
    pub service_offering_id: String,
    #[serde(default)]
    pub labels: Labels,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServicePlan {
    pub fn new(
        id: impl Into<String>,
        catalog_id: impl Into<String>,
        service_offering_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let catalog_id = catalog_id.into();
        Self {
            id: id.into(),
            name: catalog_id.clone(),
            catalog_id,
            service_offering_id: service_offering_id.into(),
            labels: Labels::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Grants a platform access to a plan. A visibility without a platform is
/// public.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Visibility {
    pub id: String,
    pub service_plan_id: String,
    #[serde(default)]
    pub platform_id: Option<String>,
    #[serde(default)]
    pub labels: Labels,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Visibility {
    pub fn new(
        id: impl Into<String>,
        service_plan_id: impl Into<String>,
        platform_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            service_plan_id: service_plan_id.into(),
            platform_id,
            labels: Labels::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Provisioned service instance.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub name: String,
    pub service_plan_id: String,
    pub platform_id: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub usable: bool,
    #[serde(default)]
    pub dashboard_url: Option<String>,
    #[serde(default)]
    pub labels: Labels,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServiceInstance {
    pub fn new(
        id: impl Into<String>,
        service_plan_id: impl Into<String>,
        platform_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            service_plan_id: service_plan_id.into(),
            platform_id: platform_id.into(),
            ready: false,
            usable: false,
            dashboard_url: None,
            labels: Labels::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Credentials binding to a service instance.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceBinding {
    pub id: String,
    pub name: String,
    pub service_instance_id: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub labels: Labels,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServiceBinding {
    pub fn new(
        id: impl Into<String>,
        service_instance_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            service_instance_id: service_instance_id.into(),
            ready: false,
            labels: Labels::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Client platform consuming the control plane.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Platform {
    pub id: String,
    pub name: String,
    pub platform_type: String,
    #[serde(default)]
    pub labels: Labels,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Platform {
    pub fn new(id: impl Into<String>, platform_type: impl Into<String>) -> Self {
        let now = Utc::now();
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            platform_type: platform_type.into(),
            labels: Labels::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Virtual tenant. Tenants are not stored; resources belong to a tenant
/// through the `label_key` label.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub label_key: String,
}

impl Tenant {
    pub fn new(id: impl Into<String>, label_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label_key: label_key.into(),
        }
    }
}

/// Tagged union over every resource kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "resource", rename_all = "snake_case")]
pub enum Resource {
    Broker(Broker),
    Offering(ServiceOffering),
    Plan(ServicePlan),
    Visibility(Visibility),
    Instance(ServiceInstance),
    Binding(ServiceBinding),
    Platform(Platform),
    Tenant(Tenant),
}

impl Resource {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Resource::Broker(_) => ResourceType::Broker,
            Resource::Offering(_) => ResourceType::Offering,
            Resource::Plan(_) => ResourceType::Plan,
            Resource::Visibility(_) => ResourceType::Visibility,
            Resource::Instance(_) => ResourceType::Instance,
            Resource::Binding(_) => ResourceType::Binding,
            Resource::Platform(_) => ResourceType::Platform,
            Resource::Tenant(_) => ResourceType::Tenant,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Resource::Broker(r) => &r.id,
            Resource::Offering(r) => &r.id,
            Resource::Plan(r) => &r.id,
            Resource::Visibility(r) => &r.id,
            Resource::Instance(r) => &r.id,
            Resource::Binding(r) => &r.id,
            Resource::Platform(r) => &r.id,
            Resource::Tenant(r) => &r.id,
        }
    }

    /// Tenants carry no labels of their own; an empty set is returned.
    pub fn labels(&self) -> &Labels {
        static EMPTY: Labels = Labels::new();
        match self {
            Resource::Broker(r) => &r.labels,
            Resource::Offering(r) => &r.labels,
            Resource::Plan(r) => &r.labels,
            Resource::Visibility(r) => &r.labels,
            Resource::Instance(r) => &r.labels,
            Resource::Binding(r) => &r.labels,
            Resource::Platform(r) => &r.labels,
            Resource::Tenant(_) => &EMPTY,
        }
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Resource::Broker(r) => Some(r.created_at),
            Resource::Offering(r) => Some(r.created_at),
            Resource::Plan(r) => Some(r.created_at),
            Resource::Visibility(r) => Some(r.created_at),
            Resource::Instance(r) => Some(r.created_at),
            Resource::Binding(r) => Some(r.created_at),
            Resource::Platform(r) => Some(r.created_at),
            Resource::Tenant(_) => None,
        }
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Resource::Broker(r) => Some(r.updated_at),
            Resource::Offering(r) => Some(r.updated_at),
            Resource::Plan(r) => Some(r.updated_at),
            Resource::Visibility(r) => Some(r.updated_at),
            Resource::Instance(r) => Some(r.updated_at),
            Resource::Binding(r) => Some(r.updated_at),
            Resource::Platform(r) => Some(r.updated_at),
            Resource::Tenant(_) => None,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        match self {
            Resource::Broker(r) => r.updated_at = now,
            Resource::Offering(r) => r.updated_at = now,
            Resource::Plan(r) => r.updated_at = now,
            Resource::Visibility(r) => r.updated_at = now,
            Resource::Instance(r) => r.updated_at = now,
            Resource::Binding(r) => r.updated_at = now,
            Resource::Platform(r) => r.updated_at = now,
            Resource::Tenant(_) => {}
        }
    }
}

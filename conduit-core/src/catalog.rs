//! Broker catalog document, as advertised by a broker.
//!
//! Only the parts the engine acts on are modelled: services and the ids of
//! their plans. Unknown keys are ignored.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerCatalog {
    #[serde(default)]
    pub services: Vec<CatalogService>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogService {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub plans: Vec<CatalogPlan>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogPlan {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

impl BrokerCatalog {
    /// Parses a stored catalog. A null document is an empty catalog.
    pub fn parse(document: &serde_json::Value) -> Result<Self> {
        if document.is_null() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_value(document.clone())?)
    }

    pub fn service(&self, catalog_id: &str) -> Option<&CatalogService> {
        self.services.iter().find(|s| s.id == catalog_id)
    }

    /// Catalog ids of every plan across all services.
    pub fn plan_ids(&self) -> BTreeSet<&str> {
        self.services
            .iter()
            .flat_map(|s| s.plans.iter().map(|p| p.id.as_str()))
            .collect()
    }
}

impl CatalogService {
    pub fn plan_ids(&self) -> impl Iterator<Item = &str> {
        self.plans.iter().map(|p| p.id.as_str())
    }
}

//! Parent/child relations walked by cascade deletes.

use std::collections::{BTreeMap, BTreeSet};

use conduit_model::{Broker, Resource, ResourceType};

use crate::store::Criterion;

/// For each child resource type: alternative criteria sets. A child matches
/// when it satisfies every criterion of at least one set.
pub type ChildrenCriterion = BTreeMap<ResourceType, Vec<Vec<Criterion>>>;

/// Children discovered for one parent, grouped by type.
pub type ChildrenMap = BTreeMap<ResourceType, Vec<Resource>>;

/// Removes children that are reachable through more than one path below the
/// same parent, so each gets exactly one delete.
pub trait DuplicatesCleaner: Send + Sync {
    fn clean_duplicates(&self, children: &mut ChildrenMap);
}

pub trait CascadeResource {
    /// How to find this resource's direct children.
    fn children_criterion(&self) -> ChildrenCriterion;

    /// Resource kinds whose subtrees can reach the same child twice.
    fn duplicates_cleaner(&self) -> Option<&dyn DuplicatesCleaner>;
}

fn single(criteria: Vec<Criterion>) -> Vec<Vec<Criterion>> {
    vec![criteria]
}

impl CascadeResource for Resource {
    fn children_criterion(&self) -> ChildrenCriterion {
        let mut children = ChildrenCriterion::new();
        match self {
            Resource::Broker(broker) => {
                let criteria = if broker.services.is_empty() {
                    vec![Criterion::eq("broker_id", broker.id.as_str())]
                } else {
                    vec![Criterion::is_in(
                        "id",
                        broker.services.iter().map(|s| s.id.as_str()),
                    )]
                };
                children.insert(ResourceType::Offering, single(criteria));
            }
            Resource::Offering(offering) => {
                let criteria = match &offering.plans {
                    Some(plans) => vec![Criterion::is_in(
                        "id",
                        plans.iter().map(|p| p.id.as_str()),
                    )],
                    None => vec![Criterion::eq(
                        "service_offering_id",
                        offering.id.as_str(),
                    )],
                };
                children.insert(ResourceType::Plan, single(criteria));
            }
            Resource::Plan(plan) => {
                children.insert(
                    ResourceType::Visibility,
                    single(vec![Criterion::eq("service_plan_id", plan.id.as_str())]),
                );
                children.insert(
                    ResourceType::Instance,
                    single(vec![Criterion::eq("service_plan_id", plan.id.as_str())]),
                );
            }
            Resource::Platform(platform) => {
                children.insert(
                    ResourceType::Visibility,
                    single(vec![Criterion::eq("platform_id", platform.id.as_str())]),
                );
                children.insert(
                    ResourceType::Instance,
                    single(vec![Criterion::eq("platform_id", platform.id.as_str())]),
                );
            }
            Resource::Tenant(tenant) => {
                children.insert(
                    ResourceType::Instance,
                    single(vec![Criterion::label_in(
                        &tenant.label_key,
                        [tenant.id.as_str()],
                    )]),
                );
            }
            Resource::Instance(instance) => {
                children.insert(
                    ResourceType::Binding,
                    single(vec![Criterion::eq(
                        "service_instance_id",
                        instance.id.as_str(),
                    )]),
                );
            }
            Resource::Visibility(_) | Resource::Binding(_) => {}
        }
        children
    }

    fn duplicates_cleaner(&self) -> Option<&dyn DuplicatesCleaner> {
        match self {
            Resource::Broker(broker) => Some(broker),
            _ => None,
        }
    }
}

/// A plan listed under several of a broker's offerings is deleted once, under
/// the first offering that lists it.
impl DuplicatesCleaner for Broker {
    fn clean_duplicates(&self, children: &mut ChildrenMap) {
        let Some(offerings) = children.get_mut(&ResourceType::Offering) else {
            return;
        };
        let mut seen = BTreeSet::new();
        for offering in offerings.iter_mut() {
            if let Resource::Offering(offering) = offering
                && let Some(plans) = offering.plans.as_mut()
            {
                plans.retain(|plan| seen.insert(plan.id.clone()));
            }
        }
    }
}

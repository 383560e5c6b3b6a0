//! Asynchronous operation engine for the Conduit control plane.
//!
//! Every long-running mutation of a managed resource is represented by a
//! persisted [`Operation`](conduit_model::Operation). This crate executes
//! those operations:
//!
//! - [`operations`]: jobs, the state machine, the bounded [`Scheduler`] and
//!   [`WorkerPool`], and the background [`OperationMaintainer`];
//! - [`cascade`]: expansion of a delete into a tree of dependent deletes and
//!   its bottom-up execution;
//! - [`store`]: the storage contract the engine persists through;
//! - [`backend`]: the contract of the executors that talk to remote brokers;
//! - [`runtime`]: the event bus and the [`Engine`] supervisor that wires it
//!   all together.
#![allow(missing_docs)]

pub mod backend;
pub mod cascade;
pub mod catalog;
pub mod error;
pub mod events;
pub mod operations;
pub mod runtime;
pub mod scope;
pub mod store;

pub use backend::{
    BackendError, BackendExecutor, BackendRegistry, DeprovisionOutcome, PollOutcome,
    ProvisionOutcome,
};
pub use cascade::{
    CascadeErrorEntry, CascadeErrors, CascadeProcessor, CascadeResource, CascadeTreeBuilder,
    CascadedOperations,
};
pub use error::{EngineError, Result};
pub use events::{OperationEvent, OperationEventPayload, OperationEventPublisher};
pub use operations::{
    ActiveOperations, CreateJob, DeleteJob, Job, JobOutcome, OperationMaintainer,
    ProvisionInstanceJob, Scheduler, UpdateJob, WorkerPool,
};
pub use runtime::{Engine, EngineBuilder, InProcOperationEventBus, OperationNotification};
pub use scope::Scope;
pub use store::{Criterion, Object, ObjectType, OperationStore, Repository};

pub mod engine;
pub mod event_bus;

pub use engine::{Engine, EngineBuilder};
pub use event_bus::{InProcOperationEventBus, OperationEventStream, OperationNotification};

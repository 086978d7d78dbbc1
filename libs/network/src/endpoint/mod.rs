//! Endpoint manager and its deferred-event machinery

pub mod context;
pub mod event;
pub mod handle;
pub mod manager;
pub mod queue;

pub use context::EndpointContext;
pub use event::{DeferredEvent, TaskWeights, TimeoutKind};
pub use handle::EndpointHandle;
pub use manager::EndpointManager;
pub use queue::{DrrQueue, EventQueue, PushResult};

//! Status/audit events and the pub/sub plumbing that carries them.

pub mod bus;
pub mod in_memory_bus;
pub mod status;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use status::{NullSink, StatusEvent, StatusSink};

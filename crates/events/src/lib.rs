//! `jobwarden-events`: job lifecycle events and in-process propagation.

pub mod bus;
pub mod event;
pub mod listener_bus;
pub mod logging;
pub mod publisher;

pub use bus::{EventBus, Subscription};
pub use event::{JobEvent, MessageEvent, State, StateChangeEvent};
pub use listener_bus::{BusError, EventListener, ListenerBus, ListenerBusBuilder, ListenerError};
pub use logging::LoggingJobEventListener;
pub use publisher::{JobEventPublisher, SharedJobBus};

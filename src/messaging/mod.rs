pub mod broker;
pub mod bus;
pub mod handler;
pub mod memory;
pub mod redpanda;

pub use broker::{headers, BrokerError, BrokerMessage, BrokerSubscription, Delivery, MessageBroker};
pub use bus::{BusConfig, BusError, DispatchError, EventBus, HandlerFailure};
pub use handler::{EventHandler, HandlerContext, HandlerRegistration};
pub use memory::InMemoryBroker;
pub use redpanda::{BrokerConfig, RedpandaBroker};

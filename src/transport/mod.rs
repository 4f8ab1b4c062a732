//! Concrete transport implementations.

mod memory;

pub use memory::create_transport as create_memory_transport;

#[cfg(feature = "transport_amqp")]
mod amqp;

#[cfg(feature = "transport_amqp")]
pub use amqp::create_transport as create_amqp_transport;

//! AMQP transport backed by `lapin`.

mod lapin;

pub use lapin::create_transport;

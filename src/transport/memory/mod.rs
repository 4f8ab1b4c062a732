//! In-memory transport (reference implementation).

mod transport;

pub use transport::create_transport;

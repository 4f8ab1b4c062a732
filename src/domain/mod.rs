//! Domain-level abstractions shared by the client and server layers.

mod transport;

pub use transport::{
    //
    Address,
    Envelope,
    Subscription,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};

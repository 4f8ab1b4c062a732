//! Request/response RPC over broker-mediated messaging with a shared
//! direct-reply destination.
//!
//! This library layers RPC semantics on top of an asynchronous message
//! transport: it generates correlation ids, matches out-of-order replies to
//! the correct waiting caller, bounds every wait with a deadline, and
//! guarantees at-most-one delivery per request under concurrent message
//! delivery.
//!
//! Instead of creating and tearing down a reply destination per call, every
//! client reuses one subscription on a broker-provided direct-reply
//! pseudo-destination ([`Address::direct_reply()`]); concurrent logical
//! replies are multiplexed over it by correlation id.
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use direct_rpc::{create_memory_transport, RpcClient, RpcConfig, RpcServer};
//!
//! # async fn example() -> direct_rpc::Result<()> {
//! let transport = create_memory_transport().await?;
//!
//! let server = RpcServer::serve(transport.clone(), "rpc.echo", |req: Bytes| async move {
//!     Ok(req)
//! })
//! .await?;
//!
//! let client =
//!     RpcClient::with_transport(transport, "rpc.echo", RpcConfig::memory("client")).await?;
//!
//! let reply = client.call(Bytes::from("hello")).await?;
//! assert_eq!(reply.payload, Bytes::from("hello"));
//!
//! server.close();
//! # Ok(())
//! # }
//! ```

// Import all sub modules once...
mod client;
mod correlation;
mod domain;
mod server;
mod transport;

mod rpc_config;

mod error;
mod macros;

pub(crate) use macros::{log_debug, log_error, log_warn};

#[cfg(feature = "transport_amqp")]
pub(crate) use macros::log_info;

// Re-export main types
pub use client::{Reply, RpcClient};
pub use server::{RpcServer, ServerHandle, DEFAULT_HANDLER_CONCURRENCY};

pub use rpc_config::RpcConfig;

pub use correlation::CorrelationId;
pub use error::{Result, RpcError};

pub use transport::create_memory_transport;

#[cfg(feature = "transport_amqp")]
pub use transport::create_amqp_transport;

// --- public re-exports
pub use domain::{
    //
    Address,
    Envelope,
    Subscription,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};

/// Create the transport selected by `config`.
///
/// With the `transport_amqp` feature enabled and a `transport_uri` present,
/// this connects to the AMQP broker; otherwise it falls back to the
/// in-memory transport.
pub async fn create_transport(config: &RpcConfig) -> Result<TransportPtr> {
    // ---
    #[cfg(feature = "transport_amqp")]
    {
        if config.transport_uri.is_some() {
            return create_amqp_transport(config).await;
        }
    }

    #[cfg(not(feature = "transport_amqp"))]
    let _ = config;

    create_memory_transport().await
}

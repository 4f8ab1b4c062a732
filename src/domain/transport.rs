// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the domain-level transport interface used by the
//! client and server layers to exchange messages. It intentionally avoids
//! any reference to concrete protocols, brokers, or client libraries.
//!
//! The transport layer is responsible only for delivering opaque envelopes
//! to subscribed consumers. Higher-level semantics such as RPC correlation
//! and timeouts are handled elsewhere.
//!
//! Concrete implementations of this interface live under `src/transport/`.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{CorrelationId, Result};

/// A transport address.
///
/// An `Address` represents a destination to which messages may be published.
/// Its interpretation is transport-specific (e.g. AMQP routing key, queue
/// name), but it is treated as an opaque identifier at the domain level.
///
/// Addresses are immutable, cheap to clone, and safe to share across threads.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Address(pub Arc<str>);

impl Address {
    /// Reserved name of the shared direct-reply pseudo-destination.
    ///
    /// Consuming from this address requires no declare/delete lifecycle, and
    /// a single subscription on it serves arbitrarily many concurrent logical
    /// replies multiplexed by correlation id. The name is wire-compatible
    /// with RabbitMQ's direct reply-to extension.
    pub const DIRECT_REPLY: &'static str = "amq.rabbitmq.reply-to";

    /// The shared direct-reply pseudo-destination.
    pub fn direct_reply() -> Self {
        Address(Arc::from(Self::DIRECT_REPLY))
    }

    /// Whether this address names the direct-reply pseudo-destination.
    pub fn is_direct_reply(&self) -> bool {
        &*self.0 == Self::DIRECT_REPLY
    }

    /// Borrow the address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T> From<T> for Address
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        Address(value.into())
    }
}

/// A subscription identifier.
///
/// A `Subscription` represents a request to receive messages addressed to
/// some destination. How a subscription matches an address is defined by the
/// transport implementation; the in-memory transport provides the reference
/// semantics (exact string match).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Subscription(pub Arc<str>);

impl From<Address> for Subscription {
    fn from(address: Address) -> Self {
        // ---
        Subscription(address.0)
    }
}

impl<T> From<T> for Subscription
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        Subscription(value.into())
    }
}

/// An opaque message envelope.
///
/// An `Envelope` is the unit of transport between producers and consumers.
/// It carries a payload along with the metadata used by the RPC layer for
/// reply routing. The transport does not interpret the payload; it must
/// round-trip `correlation_id` and `reply_to` byte-for-byte through a full
/// send/receive cycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    // ---
    /// Delivery address used by the transport for routing.
    pub address: Address,

    /// Opaque payload bytes. Interpretation belongs to the application.
    pub payload: Bytes,

    /// Correlation identifier associating a request with its reply.
    pub correlation_id: Option<CorrelationId>,

    /// Where the reply must be sent. `Some` only on requests that expect
    /// a reply; `None` means fire-and-forget.
    pub reply_to: Option<Address>,
}

impl Envelope {
    // ---
    /// Create a request envelope that expects a reply at `reply_to`.
    pub fn request(
        address: Address,
        payload: Bytes,
        correlation_id: CorrelationId,
        reply_to: Address,
    ) -> Self {
        // ---
        Self {
            address,
            payload,
            correlation_id: Some(correlation_id),
            reply_to: Some(reply_to),
        }
    }

    /// Create a fire-and-forget envelope. No reply is expected.
    pub fn fire_and_forget(address: Address, payload: Bytes) -> Self {
        // ---
        Self {
            address,
            payload,
            correlation_id: None,
            reply_to: None,
        }
    }

    /// Create a reply envelope.
    ///
    /// `address` comes from the request's `reply_to`; `correlation_id` must
    /// echo the originating request's id unchanged.
    pub fn reply(address: Address, payload: Bytes, correlation_id: CorrelationId) -> Self {
        // ---
        Self {
            address,
            payload,
            correlation_id: Some(correlation_id),
            reply_to: None,
        }
    }
}

/// Handle returned from a successful subscription.
///
/// The subscription remains active until either the handle is dropped
/// (receiver channel closes) or the transport is closed. Dropping the
/// handle unsubscribes.
pub struct SubscriptionHandle {
    // ---
    /// Receiver channel for delivered envelopes matching this subscription.
    pub inbox: mpsc::Receiver<Envelope>,

    /// The concrete address the broker resolved this subscription to.
    ///
    /// For ordinary subscriptions this echoes the requested address. For the
    /// direct-reply pseudo-destination the broker assigns a per-subscriber
    /// address; publishing to it reaches exactly this inbox.
    pub address: Address,
}

/// Transport abstraction.
///
/// A `Transport` provides best-effort delivery of message envelopes between
/// producers and subscribers; correlation and timeouts are layered on top.
///
/// Implementations must ensure that:
/// - Once `subscribe()` returns successfully, messages published *after*
///   that point and matching the subscription are deliverable.
/// - `publish()` is non-blocking with respect to subscribers.
/// - No ordering is guaranteed across distinct subscriptions; within one
///   subscription, envelopes arrive in the order the broker delivers them.
///
/// The in-memory transport serves as the reference implementation of these
/// semantics.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Publish an envelope to its address.
    async fn publish(&self, env: Envelope) -> Result<()>;

    /// Register a subscription and return a handle for receiving messages.
    async fn subscribe(&self, sub: Subscription) -> Result<SubscriptionHandle>;

    /// Close the transport and release any associated resources.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// An `Arc<dyn Transport>`: `.clone()` is cheap, clones share the same
/// underlying connection, and concrete transport types stay hidden behind
/// a stable domain interface.
pub type TransportPtr = Arc<dyn Transport>;

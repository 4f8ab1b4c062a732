// src/transport/memory/transport.rs

//! In-memory transport implementation.
//!
//! This file contains the concrete implementation of the domain-level
//! `Transport` trait using in-process data structures only.
//!
//! The memory transport is the **reference implementation** of transport
//! semantics. Other transports are expected to approximate this behavior
//! as closely as their underlying systems allow and to document any
//! unavoidable deviations.
//!
//! ## Direct reply
//!
//! Subscribing to [`Address::direct_reply()`] requires no declaration step.
//! The transport mints a unique resolved reply address for the subscriber
//! (modeling the broker's per-consumer rewrite) and routes envelopes
//! published to that address to exactly that inbox. A reply published after
//! the subscriber is gone is dropped, matching broker behavior.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::{
    // ---
    Address,
    Envelope,
    Result,
    Subscription,
    SubscriptionHandle,
    Transport,
    TransportPtr,
};

/// In-memory transport.
///
/// This transport simulates a message broker entirely within the process.
/// It is intended for testing and for validating higher-level behavior
/// without introducing network, broker, or timing-related variability.
///
/// ## Semantics
///
/// - Subscriptions are registered immediately.
/// - Once `subscribe()` returns, subsequent matching publishes are deliverable.
/// - Ordinary subscriptions match addresses by exact string equality.
/// - Dropping a `SubscriptionHandle` implicitly unregisters the subscription.
///
/// ## Non-Goals
///
/// - Persistence or durability
/// - Network behavior or failure simulation
struct MemoryTransport {
    // ---
    subscriptions: RwLock<HashMap<Subscription, Vec<mpsc::Sender<Envelope>>>>,

    /// Resolved direct-reply addresses, each routed to a single inbox.
    reply_inboxes: RwLock<HashMap<Address, mpsc::Sender<Envelope>>>,
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---

    /// Publish an envelope.
    ///
    /// A resolved direct-reply address delivers to exactly one inbox;
    /// everything else fans out to all exactly-matching subscriptions.
    async fn publish(&self, env: Envelope) -> Result<()> {
        // ---
        let reply_consumer_gone = {
            let replies = self.reply_inboxes.read().await;
            match replies.get(&env.address) {
                Some(sender) => {
                    if sender.send(env.clone()).await.is_ok() {
                        return Ok(());
                    }
                    true
                }
                None => false,
            }
        };

        if reply_consumer_gone {
            // Broker behavior: a reply to a departed consumer is dropped.
            self.reply_inboxes.write().await.remove(&env.address);
            crate::log_debug!("dropping reply to {}: consumer gone", env.address.as_str());
            return Ok(());
        }

        let subs = self.subscriptions.read().await;

        for (sub, senders) in subs.iter() {
            if sub.0 == env.address.0 {
                for sender in senders {
                    // Ignore send failures; a closed channel indicates
                    // a dropped SubscriptionHandle.
                    let _ = sender.send(env.clone()).await;
                }
            }
        }

        Ok(())
    }

    /// Register a subscription.
    ///
    /// Subscribing to the direct-reply pseudo-destination mints a unique
    /// resolved address, reported in the returned handle; ordinary
    /// subscriptions echo the requested address.
    async fn subscribe(&self, sub: Subscription) -> Result<SubscriptionHandle> {
        // ---
        let (tx, rx) = mpsc::channel(16);

        if &*sub.0 == Address::DIRECT_REPLY {
            let resolved = Address::from(format!("{}.{}", Address::DIRECT_REPLY, Uuid::new_v4()));
            self.reply_inboxes.write().await.insert(resolved.clone(), tx);

            return Ok(SubscriptionHandle {
                inbox: rx,
                address: resolved,
            });
        }

        let address = Address(sub.0.clone());

        let mut subs = self.subscriptions.write().await;
        subs.entry(sub).or_insert_with(Vec::new).push(tx);

        Ok(SubscriptionHandle { inbox: rx, address })
    }

    /// Close the transport.
    ///
    /// For the in-memory transport, this clears all subscriptions.
    async fn close(&self) -> Result<()> {
        // ---
        self.subscriptions.write().await.clear();
        self.reply_inboxes.write().await.clear();
        Ok(())
    }
}

/// Create a new in-memory transport.
///
/// This transport is always available and requires no external resources.
pub async fn create_transport() -> Result<TransportPtr> {
    // ---
    let transport = MemoryTransport {
        // ---
        subscriptions: RwLock::new(HashMap::new()),
        reply_inboxes: RwLock::new(HashMap::new()),
    };

    Ok(Arc::new(transport))
}

// src/client/rpc_client.rs

//! RPC client implementation.
//!
//! # Architecture
//!
//! The client holds exactly one subscription on the shared direct-reply
//! pseudo-destination and runs a background reply listener to match incoming
//! replies with pending calls via the correlation table. Reusing that single
//! subscription is the point of this design: no reply destination is created
//! or torn down per call.
//!
//! Each call generates a unique correlation id and registers a oneshot slot
//! in the table. When a reply arrives, the listener resolves the entry and
//! wakes the waiting call.
//!
//! # Concurrency
//!
//! Any number of calls may be in flight concurrently on one client. Waiting
//! is cooperative (a oneshot receive with a deadline), never a dedicated
//! thread or a busy poll. The table's internal mutex is the only shared
//! serialization point and holds nothing but HashMap insert/remove.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time;

use crate::correlation::{lock_ignore_poison, CorrelationTable};
use crate::{
    // ---
    Address,
    CorrelationId,
    Envelope,
    Result,
    RpcConfig,
    RpcError,
    Subscription,
    TransportPtr,
};

/// A correlated reply as observed by the caller.
#[derive(Clone, Debug)]
pub struct Reply {
    /// Echoes the originating request's correlation id.
    pub correlation_id: CorrelationId,
    /// Reply payload, returned verbatim.
    pub payload: Bytes,
}

/// Running RPC client instance bound to one request destination.
///
/// Cheap to clone (internally `Arc`-backed); clones share the reply
/// subscription and the correlation table.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    transport: TransportPtr,
    request_address: Address,
    /// Broker-resolved address of our shared reply subscription; stamped
    /// into every request's `reply_to`.
    reply_address: Address,
    table: Arc<CorrelationTable>,
    config: RpcConfig,
    closed: AtomicBool,

    /// Reply listener handle, taken and aborted on close.
    rx_task: Mutex<Option<JoinHandle<()>>>,
}

/// Removes the table entry if the owning call unwinds or is dropped
/// mid-wait, so abandoned calls never leak pending entries.
struct CancelOnDrop<'a> {
    table: &'a CorrelationTable,
    id: CorrelationId,
    armed: bool,
}

impl CancelOnDrop<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.table.cancel(&self.id);
        }
    }
}

impl RpcClient {
    // ---
    /// Create a client with an explicitly provided transport.
    ///
    /// Subscribes once to the shared direct-reply pseudo-destination and
    /// spawns the reply listener. This is the constructor you want for tests
    /// and for sharing one transport between client and server.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Transport` if the reply subscription cannot be
    /// established.
    pub async fn with_transport(
        transport: TransportPtr,
        request_address: impl Into<Address>,
        config: RpcConfig,
    ) -> Result<Self> {
        // ---
        let handle = transport
            .subscribe(Subscription::from(Address::direct_reply()))
            .await?;

        let reply_address = handle.address.clone();
        let mut inbox = handle.inbox;

        let table = Arc::new(CorrelationTable::new());

        // The listener holds only a weak reference so dropping the last
        // client clone lets the table (and the client state) go away; the
        // loop then exits on the next delivery or when the transport closes.
        let weak = Arc::downgrade(&table);

        let rx_task = tokio::spawn(async move {
            // ---
            while let Some(env) = inbox.recv().await {
                let table = match weak.upgrade() {
                    Some(table) => table,
                    None => break,
                };

                match env.correlation_id {
                    Some(id) => {
                        // Unmatched replies (late arrival after timeout, or
                        // duplicate delivery) are dropped, never an error.
                        if !table.resolve(&id, env.payload) {
                            crate::log_debug!("dropping unmatched reply (correlation id {id})");
                        }
                    }
                    None => {
                        crate::log_warn!("dropping reply without a correlation id");
                    }
                }
            }

            crate::log_debug!("reply listener stopped");
        });

        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                request_address: request_address.into(),
                reply_address,
                table,
                config,
                closed: AtomicBool::new(false),
                rx_task: Mutex::new(Some(rx_task)),
            }),
        })
    }

    /// Convenience constructor that selects the config-driven transport.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Transport` if transport creation or the reply
    /// subscription fails.
    pub async fn new(config: &RpcConfig, request_address: impl Into<Address>) -> Result<Self> {
        // ---
        let transport = crate::create_transport(config).await?;
        Self::with_transport(transport, request_address, config.clone()).await
    }

    /// Send a request and await its reply, using the configured default
    /// deadline.
    ///
    /// # Errors
    ///
    /// - `RpcError::Timeout` - no reply within the deadline
    /// - `RpcError::Cancelled` - the wait was abandoned (client closed)
    /// - `RpcError::Transport` - the publish failed
    pub async fn call(&self, payload: impl Into<Bytes>) -> Result<Reply> {
        // ---
        self.call_with_timeout(payload, self.inner.config.request_timeout)
            .await
    }

    /// Send a request and await its reply, bounded by `timeout`.
    ///
    /// Exactly one outcome is observed per call. If the deadline and a
    /// late reply race, whichever removes the table entry first wins:
    /// a reply that resolved just before the cancel is returned, not
    /// discarded.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub async fn call_with_timeout(
        &self,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Reply> {
        // ---
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Cancelled);
        }

        let payload = payload.into();
        let correlation_id = CorrelationId::generate();

        let mut rx = self.inner.table.register(correlation_id.clone())?;

        let mut guard = CancelOnDrop {
            table: &self.inner.table,
            id: correlation_id.clone(),
            armed: true,
        };

        let env = Envelope::request(
            self.inner.request_address.clone(),
            payload,
            correlation_id.clone(),
            self.inner.reply_address.clone(),
        );

        // On publish failure the guard removes the just-registered entry.
        self.inner.transport.publish(env).await?;

        match time::timeout(timeout, &mut rx).await {
            Ok(Ok(payload)) => {
                // Resolved: the listener already removed the entry.
                guard.disarm();
                Ok(Reply {
                    correlation_id,
                    payload,
                })
            }
            Ok(Err(_closed)) => {
                // Slot dropped without a reply: cancelled by close().
                guard.disarm();
                Err(RpcError::Cancelled)
            }
            Err(_elapsed) => {
                guard.disarm();
                if self.inner.table.cancel(&correlation_id) {
                    // We removed a live entry first: a genuine timeout.
                    Err(RpcError::Timeout)
                } else {
                    // Resolution raced in just before the cancel. The table
                    // delivers under its lock, so the reply is already in
                    // the slot; timeout and success never both fire.
                    match rx.try_recv() {
                        Ok(payload) => Ok(Reply {
                            correlation_id,
                            payload,
                        }),
                        Err(_) => Err(RpcError::Cancelled),
                    }
                }
            }
        }
    }

    /// The broker-resolved address replies are delivered to.
    pub fn reply_address(&self) -> &Address {
        &self.inner.reply_address
    }

    /// Number of calls currently awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.table.len()
    }

    /// Shut the client down.
    ///
    /// Cancels every pending call (waiters observe `RpcError::Cancelled`)
    /// and stops the reply listener. Idempotent; secondary calls are no-ops.
    /// The transport is left open, since it may be shared.
    pub fn close(&self) {
        // ---
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = lock_ignore_poison(&self.inner.rx_task).take() {
            task.abort();
        }

        self.inner.table.cancel_all();
    }
}

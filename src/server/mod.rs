//! RPC server: subscribes to a request destination and answers with
//! correlated replies.
//!
//! # Delivery model
//!
//! The broker's push-style delivery is modeled as one dedicated loop reading
//! the subscription inbox and handing each request to a spawned handler task.
//! A semaphore bounds how many handlers run at once; when the bound is
//! reached the loop stops pulling from the inbox, which backpressures the
//! transport instead of fanning out without limit.
//!
//! # Handler failures
//!
//! A failing handler is logged and produces **no** reply, so the caller
//! observes a timeout rather than an error reply. This conflation is a
//! deliberate simplicity/robustness trade-off: one bad request must never
//! take down the delivery loop or leak broker-side state.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::correlation::lock_ignore_poison;
use crate::{Address, Envelope, Result, Subscription, TransportPtr};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Type-erased async handler: request payload in, reply payload out.
type HandlerFn = Arc<dyn Fn(Bytes) -> BoxFuture<Result<Bytes>> + Send + Sync>;

/// Default bound on concurrently running handlers.
pub const DEFAULT_HANDLER_CONCURRENCY: usize = 32;

/// RPC server factory.
///
/// # Example
///
/// ```no_run
/// use bytes::Bytes;
/// use direct_rpc::{create_memory_transport, RpcServer};
///
/// # async fn example() -> direct_rpc::Result<()> {
/// let transport = create_memory_transport().await?;
///
/// let handle = RpcServer::serve(transport, "rpc.echo", |req: Bytes| async move {
///     Ok(req)
/// })
/// .await?;
///
/// // ... later
/// handle.close();
/// # Ok(())
/// # }
/// ```
pub struct RpcServer;

impl RpcServer {
    // ---

    /// Subscribe to `request_address` and answer requests with `handler`.
    ///
    /// For each inbound request the handler is invoked with the payload. If
    /// the request carries a `reply_to`, the handler's result is sent back
    /// there with the original correlation id preserved; otherwise the
    /// result is discarded (fire-and-forget).
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Transport` if the request subscription cannot be
    /// established.
    pub async fn serve<F, Fut>(
        transport: TransportPtr,
        request_address: impl Into<Address>,
        handler: F,
    ) -> Result<ServerHandle>
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        // ---
        Self::serve_with_concurrency(
            transport,
            request_address,
            DEFAULT_HANDLER_CONCURRENCY,
            handler,
        )
        .await
    }

    /// Like [`serve`](Self::serve) with an explicit bound on concurrently
    /// running handlers.
    pub async fn serve_with_concurrency<F, Fut>(
        transport: TransportPtr,
        request_address: impl Into<Address>,
        max_in_flight: usize,
        handler: F,
    ) -> Result<ServerHandle>
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        // ---
        let request_address = request_address.into();

        let handle = transport
            .subscribe(Subscription::from(request_address.clone()))
            .await?;
        let mut inbox = handle.inbox;

        let handler: HandlerFn =
            Arc::new(move |payload| -> BoxFuture<Result<Bytes>> { Box::pin(handler(payload)) });

        let limiter = Arc::new(Semaphore::new(max_in_flight.max(1)));

        let task = tokio::spawn(async move {
            // ---
            crate::log_debug!("request loop started for {}", request_address.as_str());

            while let Some(env) = inbox.recv().await {
                let permit = match Arc::clone(&limiter).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_closed) => break,
                };

                let handler = Arc::clone(&handler);
                let transport = transport.clone();

                tokio::spawn(async move {
                    let _in_flight = permit;
                    dispatch(transport, handler, env).await;
                });
            }

            crate::log_debug!("request loop stopped for {}", request_address.as_str());
        });

        Ok(ServerHandle {
            task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
        })
    }
}

/// Invoke the handler for one request and route its reply, if any.
///
/// Errors stop at this boundary: a handler failure or a publish failure is
/// logged and the delivery loop keeps running.
async fn dispatch(transport: TransportPtr, handler: HandlerFn, env: Envelope) {
    // ---
    let reply_to = env.reply_to;
    let correlation_id = env.correlation_id;

    let payload = match handler(env.payload).await {
        Ok(payload) => payload,
        Err(_err) => {
            // No reply on failure; the caller observes a timeout.
            crate::log_warn!("handler failed, no reply sent: {_err}");
            return;
        }
    };

    // Fire-and-forget request: result discarded.
    let Some(reply_to) = reply_to else {
        return;
    };

    let Some(correlation_id) = correlation_id else {
        crate::log_warn!("request had a reply address but no correlation id, dropping reply");
        return;
    };

    let reply = Envelope::reply(reply_to, payload, correlation_id);
    if let Err(err) = transport.publish(reply).await {
        crate::log_error!("failed to publish reply: {err}");
    }
}

/// Handle to a running server.
///
/// The server keeps running until the handle is closed or dropped.
pub struct ServerHandle {
    // ---
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ServerHandle {
    /// Stop the server, releasing its subscription deterministically.
    ///
    /// Aborting the delivery loop drops the subscription handle, which
    /// unsubscribes from the transport. Idempotent: secondary calls are
    /// no-ops and never raise.
    pub fn close(&self) {
        // ---
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = lock_ignore_poison(&self.task).take() {
            task.abort();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.close();
    }
}

//! End-to-end tests over the in-memory transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use direct_rpc::{
    //
    create_memory_transport,
    Address,
    CorrelationId,
    Envelope,
    Result,
    RpcClient,
    RpcConfig,
    RpcError,
    RpcServer,
    ServerHandle,
    Subscription,
    TransportPtr,
};

const REQUEST_QUEUE: &str = "test.queue.rpc";

/// Server that decorates payloads the way the classic RPC smoke test does.
async fn decorating_server(transport: TransportPtr) -> Result<ServerHandle> {
    // ---
    RpcServer::serve(transport, REQUEST_QUEUE, |req: Bytes| async move {
        let text = String::from_utf8_lossy(&req).into_owned();
        Ok(Bytes::from(format!("*** {text} ***")))
    })
    .await
}

#[tokio::test]
async fn test_round_trip_decorates_payload() -> Result<()> {
    // ---
    let transport = create_memory_transport().await?;
    let server = decorating_server(transport.clone()).await?;

    let client =
        RpcClient::with_transport(transport, REQUEST_QUEUE, RpcConfig::memory("client")).await?;

    let reply = client.call(Bytes::from("hello")).await?;
    assert_eq!(reply.payload, Bytes::from("*** hello ***"));

    // The entry is gone once the reply is delivered.
    assert_eq!(client.pending_calls(), 0);

    server.close();
    Ok(())
}

#[tokio::test]
async fn test_timeout_when_nobody_replies() -> Result<()> {
    // ---
    let transport = create_memory_transport().await?;

    // No server subscribed at all.
    let client =
        RpcClient::with_transport(transport, REQUEST_QUEUE, RpcConfig::memory("client")).await?;

    let started = Instant::now();
    let res = client
        .call_with_timeout(Bytes::from("anyone there?"), Duration::from_millis(200))
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(res, Err(RpcError::Timeout)), "got {res:?}");
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(2), "timeout took {elapsed:?}");

    // Timeout cleanup removed the correlation entry.
    assert_eq!(client.pending_calls(), 0);

    Ok(())
}

#[tokio::test]
async fn test_concurrent_calls_no_cross_talk() -> Result<()> {
    // ---
    let transport = create_memory_transport().await?;

    let server = RpcServer::serve(transport.clone(), REQUEST_QUEUE, |req: Bytes| async move {
        let text = String::from_utf8_lossy(&req).to_uppercase();
        Ok(Bytes::from(text))
    })
    .await?;

    let client =
        RpcClient::with_transport(transport, REQUEST_QUEUE, RpcConfig::memory("client")).await?;

    let mut handles = Vec::new();

    for i in 0..50 {
        // ---
        let c = client.clone();

        handles.push(tokio::spawn(async move {
            let payload = format!("payload-{i}");
            let reply = c.call(Bytes::from(payload.clone())).await.unwrap();
            (payload.to_uppercase(), reply.payload)
        }));
    }

    for task in handles {
        let (expected, actual) = task.await.unwrap();
        assert_eq!(actual, Bytes::from(expected));
    }

    assert_eq!(client.pending_calls(), 0);
    server.close();
    Ok(())
}

#[tokio::test]
async fn test_hundreds_of_concurrent_calls_stay_isolated() -> Result<()> {
    // ---
    let transport = create_memory_transport().await?;

    // Echo each payload back so any mismatch pins the cross-talk.
    let server = RpcServer::serve(transport.clone(), REQUEST_QUEUE, |req: Bytes| async move {
        Ok(req)
    })
    .await?;

    let client =
        RpcClient::with_transport(transport, REQUEST_QUEUE, RpcConfig::memory("client")).await?;

    let mut handles = Vec::new();

    for i in 0..300 {
        // ---
        let c = client.clone();

        handles.push(tokio::spawn(async move {
            let payload = format!("call-{i}");
            let reply = c.call(Bytes::from(payload.clone())).await.unwrap();
            (payload, reply.payload)
        }));
    }

    for task in handles {
        let (expected, actual) = task.await.unwrap();
        assert_eq!(actual, Bytes::from(expected));
    }

    assert_eq!(client.pending_calls(), 0);
    server.close();
    Ok(())
}

#[tokio::test]
async fn test_deadline_racing_reply_settles_to_one_outcome() -> Result<()> {
    // ---
    let transport = create_memory_transport().await?;

    // Handler latency equal to the call deadline, so each call lands right
    // in the window where the timeout and the reply compete for the entry.
    let latency = Duration::from_millis(50);

    let server = RpcServer::serve(transport.clone(), REQUEST_QUEUE, move |req: Bytes| async move {
        tokio::time::sleep(latency).await;
        Ok(req)
    })
    .await?;

    let client =
        RpcClient::with_transport(transport, REQUEST_QUEUE, RpcConfig::memory("client")).await?;

    for i in 0..50 {
        // ---
        let payload = format!("race-{i}");
        let res = client
            .call_with_timeout(Bytes::from(payload.clone()), latency)
            .await;

        // Whichever side wins, the caller sees exactly one of the two
        // outcomes, and a winning reply is the right one.
        match res {
            Ok(reply) => assert_eq!(reply.payload, Bytes::from(payload)),
            Err(RpcError::Timeout) => {}
            Err(other) => panic!("call {i} settled to {other:?}"),
        }

        assert_eq!(client.pending_calls(), 0);
    }

    server.close();
    Ok(())
}

#[tokio::test]
async fn test_unmatched_reply_is_dropped() -> Result<()> {
    // ---
    let transport = create_memory_transport().await?;
    let server = decorating_server(transport.clone()).await?;

    let client = RpcClient::with_transport(
        transport.clone(),
        REQUEST_QUEUE,
        RpcConfig::memory("client"),
    )
    .await?;

    // Deliver a stray reply straight to the client's reply address with a
    // correlation id nobody is waiting on.
    let stray = Envelope::reply(
        client.reply_address().clone(),
        Bytes::from("stray"),
        CorrelationId::generate(),
    );
    transport.publish(stray).await?;

    // And one with no correlation id at all.
    let malformed = Envelope {
        address: client.reply_address().clone(),
        payload: Bytes::from("malformed"),
        correlation_id: None,
        reply_to: None,
    };
    transport.publish(malformed).await?;

    // The listener absorbed both; a normal call still works.
    let reply = client.call(Bytes::from("still alive")).await?;
    assert_eq!(reply.payload, Bytes::from("*** still alive ***"));

    server.close();
    Ok(())
}

#[tokio::test]
async fn test_duplicate_reply_delivered_at_most_once() -> Result<()> {
    // ---
    let transport = create_memory_transport().await?;

    // Hand-rolled responder that misbehaves: it answers every request twice.
    let mut inbox = transport
        .subscribe(Subscription::from(REQUEST_QUEUE))
        .await?
        .inbox;
    let responder_transport = transport.clone();
    let responder = tokio::spawn(async move {
        while let Some(env) = inbox.recv().await {
            let (Some(reply_to), Some(id)) = (env.reply_to, env.correlation_id) else {
                continue;
            };
            for _ in 0..2 {
                let reply = Envelope::reply(reply_to.clone(), env.payload.clone(), id.clone());
                responder_transport.publish(reply).await.unwrap();
            }
        }
    });

    let client = RpcClient::with_transport(
        transport.clone(),
        REQUEST_QUEUE,
        RpcConfig::memory("client"),
    )
    .await?;

    let first = client.call(Bytes::from("one")).await?;
    assert_eq!(first.payload, Bytes::from("one"));

    // The duplicate was dropped; a second call gets its own reply, not the
    // leftover duplicate of the first.
    let second = client.call(Bytes::from("two")).await?;
    assert_eq!(second.payload, Bytes::from("two"));
    assert_eq!(client.pending_calls(), 0);

    responder.abort();
    Ok(())
}

#[tokio::test]
async fn test_late_reply_after_timeout_is_harmless() -> Result<()> {
    // ---
    let transport = create_memory_transport().await?;

    let server = RpcServer::serve(transport.clone(), REQUEST_QUEUE, |req: Bytes| async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(req)
    })
    .await?;

    let client =
        RpcClient::with_transport(transport, REQUEST_QUEUE, RpcConfig::memory("client")).await?;

    let res = client
        .call_with_timeout(Bytes::from("slow"), Duration::from_millis(100))
        .await;
    assert!(matches!(res, Err(RpcError::Timeout)), "got {res:?}");
    assert_eq!(client.pending_calls(), 0);

    // Let the late reply land on the listener; it must be dropped quietly.
    tokio::time::sleep(Duration::from_millis(400)).await;

    // Other calls are unaffected.
    let reply = client
        .call_with_timeout(Bytes::from("fast enough"), Duration::from_secs(1))
        .await?;
    assert_eq!(reply.payload, Bytes::from("fast enough"));

    server.close();
    Ok(())
}

#[tokio::test]
async fn test_server_close_is_idempotent() -> Result<()> {
    // ---
    let transport = create_memory_transport().await?;
    let server = decorating_server(transport.clone()).await?;

    let client =
        RpcClient::with_transport(transport, REQUEST_QUEUE, RpcConfig::memory("client")).await?;

    let reply = client.call(Bytes::from("ping")).await?;
    assert_eq!(reply.payload, Bytes::from("*** ping ***"));

    server.close();
    server.close();

    // With the server gone, calls time out instead of erroring.
    let res = client
        .call_with_timeout(Bytes::from("ping"), Duration::from_millis(200))
        .await;
    assert!(matches!(res, Err(RpcError::Timeout)), "got {res:?}");

    Ok(())
}

#[tokio::test]
async fn test_client_close_cancels_pending_calls() -> Result<()> {
    // ---
    let transport = create_memory_transport().await?;

    // Nobody will ever reply.
    let client =
        RpcClient::with_transport(transport, REQUEST_QUEUE, RpcConfig::memory("client")).await?;

    let waiter = client.clone();
    let pending = tokio::spawn(async move {
        waiter
            .call_with_timeout(Bytes::from("doomed"), Duration::from_secs(30))
            .await
    });

    // Give the call time to register and publish.
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.close();

    let res = pending.await.unwrap();
    assert!(matches!(res, Err(RpcError::Cancelled)), "got {res:?}");

    // Closed clients refuse new calls.
    let res = client.call(Bytes::from("nope")).await;
    assert!(matches!(res, Err(RpcError::Cancelled)), "got {res:?}");

    Ok(())
}

#[tokio::test]
async fn test_fire_and_forget_discards_result() -> Result<()> {
    // ---
    let transport = create_memory_transport().await?;

    let seen = Arc::new(AtomicUsize::new(0));
    let seen_by_handler = Arc::clone(&seen);

    let server = RpcServer::serve(transport.clone(), REQUEST_QUEUE, move |req: Bytes| {
        let seen = Arc::clone(&seen_by_handler);
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(req)
        }
    })
    .await?;

    // Request with no reply_to: handler runs, result is discarded.
    let env = Envelope::fire_and_forget(Address::from(REQUEST_QUEUE), Bytes::from("notify"));
    transport.publish(env).await?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    server.close();
    Ok(())
}

#[tokio::test]
async fn test_handler_failure_yields_timeout() -> Result<()> {
    // ---
    let transport = create_memory_transport().await?;

    let server = RpcServer::serve(transport.clone(), REQUEST_QUEUE, |_req: Bytes| async move {
        Err(RpcError::Transport("handler exploded".into()))
    })
    .await?;

    let client =
        RpcClient::with_transport(transport, REQUEST_QUEUE, RpcConfig::memory("client")).await?;

    // No error reply is sent for a failed handler; the caller times out.
    let res = client
        .call_with_timeout(Bytes::from("boom"), Duration::from_millis(200))
        .await;
    assert!(matches!(res, Err(RpcError::Timeout)), "got {res:?}");
    assert_eq!(client.pending_calls(), 0);

    server.close();
    Ok(())
}

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use wirebus::{BinaryMessage, WireFormat, DEFAULT_UNACK_DELAY};
use wirebus_test::{endpoint, loopback, wait_until, Ping};

#[tokio::test(start_paused = true)]
async fn deferred_ack_commits_inside_its_window() {
    let (transport, bus) = loopback();
    let target = endpoint("deferred");

    let delivered = Arc::new(AtomicUsize::new(0));
    let counted = delivered.clone();
    let _sub = bus
        .subscribe_with_ack(&target, move |_ping: Ping, ack| {
            counted.fetch_add(1, Ordering::SeqCst);
            ack.settle(Duration::from_millis(200), true);
            Ok(())
        })
        .await
        .unwrap();

    let start = Instant::now();
    bus.send(&Ping(1), &target).await.unwrap();
    wait_until(|| delivered.load(Ordering::SeqCst) == 1).await;

    // Callback has run, but the raw ack must not have committed yet.
    assert!(start.elapsed() < Duration::from_millis(200));
    assert!(transport.acks().is_empty());

    wait_until(|| !transport.acks().is_empty()).await;
    let ack = &transport.acks()[0];
    assert!(ack.accepted);
    let delay = ack.at.duration_since(start);
    assert!(delay >= Duration::from_millis(200), "committed early: {delay:?}");
    assert!(delay <= Duration::from_millis(400), "committed late: {delay:?}");
    bus.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn zero_delay_settles_are_immediate_raw_acks() {
    let (transport, bus) = loopback();
    let accepts = endpoint("accepts");
    let rejects = endpoint("rejects");

    let _accepting = bus
        .subscribe_with_ack(&accepts, |_ping: Ping, ack| {
            ack.settle(Duration::ZERO, true);
            Ok(())
        })
        .await
        .unwrap();
    let _rejecting = bus
        .subscribe_with_ack(&rejects, |_ping: Ping, ack| {
            ack.settle(Duration::ZERO, false);
            Ok(())
        })
        .await
        .unwrap();

    let start = Instant::now();
    bus.send(&Ping(1), &accepts).await.unwrap();
    bus.send(&Ping(2), &rejects).await.unwrap();
    wait_until(|| transport.acks().len() == 2).await;

    for ack in transport.acks() {
        assert!(ack.at.duration_since(start) < Duration::from_millis(50));
        match ack.destination.as_str() {
            "accepts" => assert!(ack.accepted),
            "rejects" => assert!(!ack.accepted),
            other => panic!("unexpected destination {other}"),
        }
    }
    bus.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn undecodable_payload_is_rejected_after_the_redelivery_delay() {
    let (transport, bus) = loopback();
    let target = endpoint("garbled");

    let delivered = Arc::new(AtomicUsize::new(0));
    let counted = delivered.clone();
    let _sub = bus
        .subscribe(&target, move |_ping: Ping| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

    let start = Instant::now();
    let garbage = BinaryMessage {
        bytes: b"definitely not json".to_vec(),
        wire_type: "Ping".into(),
    };
    bus.send_raw(garbage, &target, Duration::ZERO).await.unwrap();

    // The reject is deferred by the redelivery delay.
    tokio::time::sleep(DEFAULT_UNACK_DELAY / 2).await;
    assert!(transport.acks().is_empty());
    tokio::time::sleep(DEFAULT_UNACK_DELAY / 2 + Duration::from_millis(50)).await;

    let acks = transport.acks();
    assert_eq!(acks.len(), 1);
    assert!(!acks[0].accepted);
    assert!(acks[0].at.duration_since(start) >= DEFAULT_UNACK_DELAY);
    // The subscriber never saw the frame.
    assert_eq!(delivered.load(Ordering::SeqCst), 0);
    bus.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failing_subscriber_rejects_after_the_redelivery_delay() {
    let (transport, bus) = loopback();
    let target = endpoint("flaky");

    let attempts = Arc::new(AtomicUsize::new(0));
    let counted = attempts.clone();
    let _sub = bus
        .subscribe(&target, move |_ping: Ping| {
            counted.fetch_add(1, Ordering::SeqCst);
            Err("subscriber rejected the message".into())
        })
        .await
        .unwrap();

    let start = Instant::now();
    bus.send(&Ping(1), &target).await.unwrap();
    wait_until(|| attempts.load(Ordering::SeqCst) == 1).await;
    assert!(transport.acks().is_empty());

    tokio::time::sleep(DEFAULT_UNACK_DELAY + Duration::from_millis(50)).await;
    let acks = transport.acks();
    assert_eq!(acks.len(), 1);
    assert!(!acks[0].accepted);
    assert!(acks[0].at.duration_since(start) >= DEFAULT_UNACK_DELAY);
    bus.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn explicit_ack_wins_over_the_error_path() {
    let (transport, bus) = loopback();
    let target = endpoint("acked-then-failed");

    let _sub = bus
        .subscribe_with_ack(&target, |_ping: Ping, ack| {
            ack.settle(Duration::ZERO, true);
            Err("failure after settling".into())
        })
        .await
        .unwrap();

    bus.send(&Ping(1), &target).await.unwrap();
    wait_until(|| !transport.acks().is_empty()).await;

    // The settle in the callback consumed the ack; the engine's error path
    // must not double-acknowledge.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let acks = transport.acks();
    assert_eq!(acks.len(), 1);
    assert!(acks[0].accepted);
    bus.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_flushes_pending_deferred_acks() {
    let (transport, bus) = loopback();
    let target = endpoint("slow-ack");

    let delivered = Arc::new(AtomicUsize::new(0));
    let counted = delivered.clone();
    let _sub = bus
        .subscribe_with_ack(&target, move |_ping: Ping, ack| {
            counted.fetch_add(1, Ordering::SeqCst);
            ack.settle(Duration::from_secs(10), true);
            Ok(())
        })
        .await
        .unwrap();

    bus.send(&Ping(1), &target).await.unwrap();
    wait_until(|| delivered.load(Ordering::SeqCst) == 1).await;
    assert!(transport.acks().is_empty());

    let start = Instant::now();
    bus.shutdown().await;
    assert!(start.elapsed() < Duration::from_secs(1));

    // Flushed by the drain, exactly once.
    let acks = transport.acks();
    assert_eq!(acks.len(), 1);
    assert!(acks[0].accepted);
}

#[tokio::test(start_paused = true)]
async fn raw_frames_interoperate_with_typed_subscribers() {
    // A pre-encoded frame carrying the right wire name and the endpoint's
    // format is indistinguishable from a typed send.
    let (_transport, bus) = loopback();
    let target = wirebus::Endpoint::new("local", "stable", WireFormat::Postcard);

    let seen = Arc::new(AtomicUsize::new(0));
    let counted = seen.clone();
    let _sub = bus
        .subscribe(&target, move |ping: Ping| {
            assert_eq!(ping, Ping(11));
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

    let frame = BinaryMessage {
        bytes: WireFormat::Postcard.to_bytes(&Ping(11)).unwrap(),
        wire_type: "Ping".into(),
    };
    bus.send_raw(frame, &target, Duration::ZERO).await.unwrap();
    wait_until(|| seen.load(Ordering::SeqCst) == 1).await;
    bus.shutdown().await;
}

//! Listener post-processing, receive semantics and the poll guard.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::Harness;
use mqbridge_core::testing::{CountingConnector, StoredMessage};
use mqbridge_core::{
    AcknowledgeMode, BridgeError, DestinationHandle, DestinationKind, EndpointConfig, ExitState,
    ListenerSettings, MessageEnvelope, PropertyValue, PullingListener, PushingListener, RunState,
    SourcePolicy,
};

fn fast_settings() -> ListenerSettings {
    ListenerSettings {
        receive_timeout_ms: 50,
        ..ListenerSettings::default()
    }
}

async fn pulling_listener(harness: &Harness, config: EndpointConfig) -> PullingListener {
    let factory_name = config.connection_factory_name.clone();
    let source = harness.source(&factory_name, SourcePolicy::default()).await;
    let facade = harness.facade(source, config);
    PullingListener::new(facade, fast_settings())
}

#[tokio::test]
async fn client_ack_only_on_non_error_outcome() {
    let harness = Harness::new();
    let mut config = EndpointConfig::new("orders-in", "qcf.ack", "orders");
    config.acknowledge_mode = AcknowledgeMode::Client;
    let listener = pulling_listener(&harness, config).await;
    listener.open().await.expect("open");

    let ok_id = harness.broker.enqueue("orders", StoredMessage::text("ok"));
    let bad_id = harness.broker.enqueue("orders", StoredMessage::text("bad"));

    let mut thread = listener.open_thread().await.expect("thread");

    let message = listener
        .receive(&mut thread, None)
        .await
        .expect("receive")
        .expect("message");
    let pipeline = listener.core().populate_context(message.as_ref());
    listener
        .after_message_processed(&mut thread, message.as_ref(), &pipeline, ExitState::Success, None)
        .await
        .expect("post-processing");
    assert!(harness.broker.was_acknowledged(&ok_id));

    let message = listener
        .receive(&mut thread, None)
        .await
        .expect("receive")
        .expect("message");
    let pipeline = listener.core().populate_context(message.as_ref());
    listener
        .after_message_processed(&mut thread, message.as_ref(), &pipeline, ExitState::Error, None)
        .await
        .expect("post-processing");
    assert!(!harness.broker.was_acknowledged(&bad_id));
    assert_eq!(harness.broker.acknowledgements.load(Ordering::SeqCst), 1);

    listener.close_thread(thread).await;
    listener.close().await;
}

#[tokio::test]
async fn locally_transacted_commits_on_success_rolls_back_on_error() {
    let harness = Harness::new();
    let mut config = EndpointConfig::new("orders-tx", "qcf.tx", "orders");
    config.session_transacted = true;
    let listener = pulling_listener(&harness, config).await;
    listener.open().await.expect("open");

    harness.broker.enqueue("orders", StoredMessage::text("one"));
    harness.broker.enqueue("orders", StoredMessage::text("two"));

    let mut thread = listener.open_thread().await.expect("thread");

    let message = listener
        .receive(&mut thread, None)
        .await
        .expect("receive")
        .expect("message");
    let pipeline = listener.core().populate_context(message.as_ref());
    listener
        .after_message_processed(&mut thread, message.as_ref(), &pipeline, ExitState::Success, None)
        .await
        .expect("post-processing");
    assert_eq!(harness.broker.commits.load(Ordering::SeqCst), 1);
    assert_eq!(harness.broker.rollbacks.load(Ordering::SeqCst), 0);

    let message = listener
        .receive(&mut thread, None)
        .await
        .expect("receive")
        .expect("message");
    let pipeline = listener.core().populate_context(message.as_ref());
    listener
        .after_message_processed(&mut thread, message.as_ref(), &pipeline, ExitState::Error, None)
        .await
        .expect("post-processing");
    assert_eq!(harness.broker.commits.load(Ordering::SeqCst), 1);
    assert_eq!(harness.broker.rollbacks.load(Ordering::SeqCst), 1);

    listener.close_thread(thread).await;
    listener.close().await;
}

#[tokio::test]
async fn correlated_receive_times_out_as_timeout_error() {
    let harness = Harness::new();
    let config = EndpointConfig::new("replies-in", "qcf.corr", "replies");
    let listener = pulling_listener(&harness, config).await;
    listener.open().await.expect("open");

    let mut thread = listener.open_thread().await.expect("thread");
    let err = match listener
        .receive(&mut thread, Some("ID:nobody-sent-this"))
        .await
    {
        Err(e) => e,
        Ok(_) => panic!("empty correlated receive must fail"),
    };
    assert!(err.is_timeout());

    listener.close_thread(thread).await;
    listener.close().await;
}

#[tokio::test]
async fn uncorrelated_receive_returns_none_when_not_started() {
    let harness = Harness::new();
    let config = EndpointConfig::new("idle-in", "qcf.idle", "idle");
    let listener = pulling_listener(&harness, config).await;
    // Not opened: run state is Stopped, so an empty poll is not retried.

    let mut thread = listener.open_thread().await.expect("thread");
    let received = listener.receive(&mut thread, None).await.expect("receive");
    assert!(received.is_none());
    listener.close_thread(thread).await;
}

#[tokio::test]
async fn retrieve_by_selector_picks_matching_message() {
    let harness = Harness::new();
    let config = EndpointConfig::new("postbox", "qcf.postbox", "postbox");
    let listener = pulling_listener(&harness, config).await;
    listener.open().await.expect("open");

    harness.broker.enqueue(
        "postbox",
        StoredMessage::text("other").with_property("slot", PropertyValue::Text("a".to_string())),
    );
    harness.broker.enqueue(
        "postbox",
        StoredMessage::text("wanted").with_property("slot", PropertyValue::Text("b".to_string())),
    );

    let message = listener
        .retrieve_by_selector("slot = 'b'")
        .await
        .expect("retrieve")
        .expect("matching message");
    assert_eq!(message.payload(), "wanted");
    assert_eq!(message.delivery_count(), Some(1));
    assert_eq!(harness.broker.queue_depth("postbox"), 1);

    listener.close().await;
}

#[tokio::test]
async fn reply_is_routed_and_correlated() {
    let harness = Harness::new();
    let config = EndpointConfig::new("rr-in", "qcf.rr", "requests");
    let source = harness.source("qcf.rr", SourcePolicy::default()).await;
    let facade = harness.facade(source, config);
    let settings = ListenerSettings {
        receive_timeout_ms: 50,
        reply_properties: vec!["trace".to_string()],
        ..ListenerSettings::default()
    };
    let listener = PullingListener::new(facade, settings);
    listener.open().await.expect("open");

    let reply_to = DestinationHandle::named("rr-replies", DestinationKind::Queue);
    harness.broker.enqueue(
        "requests",
        StoredMessage::text("ping")
            .with_correlation_id("cid-7")
            .with_reply_to(reply_to)
            .with_property("trace", PropertyValue::Text("t-42".to_string())),
    );

    let mut thread = listener.open_thread().await.expect("thread");
    let message = listener
        .receive(&mut thread, None)
        .await
        .expect("receive")
        .expect("message");
    let pipeline = listener.core().populate_context(message.as_ref());
    listener
        .after_message_processed(
            &mut thread,
            message.as_ref(),
            &pipeline,
            ExitState::Success,
            Some(MessageEnvelope::text("pong")),
        )
        .await
        .expect("post-processing");

    let reply = harness
        .broker
        .first_message("rr-replies")
        .expect("reply delivered");
    assert_eq!(reply.payload, "pong");
    assert_eq!(reply.correlation_id.as_deref(), Some("cid-7"));
    assert_eq!(
        reply.properties.get("trace"),
        Some(&PropertyValue::Text("t-42".to_string()))
    );

    listener.close_thread(thread).await;
    listener.close().await;
}

#[tokio::test]
async fn vanished_reply_destination_fails_live_request() {
    let harness = Harness::new();
    let config = EndpointConfig::new("rr-dead", "qcf.dead", "requests");
    let listener = pulling_listener(&harness, config).await;
    listener.open().await.expect("open");

    let reply_to = DestinationHandle::named("dead-replies", DestinationKind::Queue);
    harness.broker.enqueue(
        "requests",
        StoredMessage::text("ping")
            .with_correlation_id("cid-9")
            .with_reply_to(reply_to),
    );
    harness.broker.mark_invalid("dead-replies");

    let mut thread = listener.open_thread().await.expect("thread");
    let message = listener
        .receive(&mut thread, None)
        .await
        .expect("receive")
        .expect("message");
    let pipeline = listener.core().populate_context(message.as_ref());

    // The request is still alive, so a reply destination that no longer
    // exists is a hard failure.
    let err = listener
        .after_message_processed(
            &mut thread,
            message.as_ref(),
            &pipeline,
            ExitState::Success,
            Some(MessageEnvelope::text("pong")),
        )
        .await
        .expect_err("reply to vanished destination must fail");
    assert!(matches!(err, BridgeError::InvalidDestination { .. }));

    listener.close_thread(thread).await;
    listener.close().await;
}

#[tokio::test]
async fn vanished_reply_destination_tolerated_for_expired_request() {
    let harness = Harness::new();
    let config = EndpointConfig::new("rr-late", "qcf.late", "requests");
    let listener = pulling_listener(&harness, config).await;
    listener.open().await.expect("open");

    let reply_to = DestinationHandle::named("late-replies", DestinationKind::Queue);
    harness.broker.enqueue(
        "requests",
        StoredMessage::text("ping")
            .with_correlation_id("cid-10")
            .with_reply_to(reply_to)
            .with_expiration_ms(1),
    );
    harness.broker.mark_invalid("late-replies");

    let mut thread = listener.open_thread().await.expect("thread");
    let message = listener
        .receive(&mut thread, None)
        .await
        .expect("receive")
        .expect("message");
    let pipeline = listener.core().populate_context(message.as_ref());

    // The requester is long gone; the best-effort grace reply may be dropped.
    listener
        .after_message_processed(
            &mut thread,
            message.as_ref(),
            &pipeline,
            ExitState::Success,
            Some(MessageEnvelope::text("pong")),
        )
        .await
        .expect("expired request tolerates a vanished reply destination");
    assert!(harness.broker.first_message("late-replies").is_none());

    listener.close_thread(thread).await;
    listener.close().await;
}

#[tokio::test]
async fn expired_request_gets_grace_ttl() {
    let harness = Harness::new();
    let config = EndpointConfig::new("exp-in", "qcf.exp", "expired");
    let listener = pulling_listener(&harness, config).await;

    let core = listener.core();
    let mut context = mqbridge_core::PipelineContext::default();

    // Expired five seconds ago: 1s grace instead of a negative lifetime.
    context.expiration_ms = 10_000;
    assert_eq!(core.reply_ttl_ms(&context, 15_000), 1_000);

    // Still alive: reply lives as long as the request.
    context.expiration_ms = 20_000;
    assert_eq!(core.reply_ttl_ms(&context, 15_000), 5_000);

    // No expiration on the request: unlimited reply.
    context.expiration_ms = 0;
    assert_eq!(core.reply_ttl_ms(&context, 15_000), 0);
}

#[tokio::test]
async fn poll_guard_restarts_stalled_connector_once() {
    let harness = Harness::new();
    let config = EndpointConfig::new("push-in", "qcf.push", "pushed");
    let source = harness.source("qcf.push", SourcePolicy::default()).await;
    let facade = harness.facade(source, config);
    let settings = ListenerSettings {
        receive_timeout_ms: 10,
        poll_guard_interval_ms: Some(40),
        ..ListenerSettings::default()
    };
    let connector = Arc::new(CountingConnector::new());
    let listener = Arc::new(PushingListener::new(
        facade,
        settings,
        Arc::clone(&connector) as Arc<dyn mqbridge_core::ListenerConnector>,
    ));

    listener.run_state().set(RunState::Started);

    // last_poll_finished was never set: the connector looks stalled.
    assert!(listener.check_poll_guard().await.expect("guard"));
    assert_eq!(connector.stop_count(), 1);
    assert_eq!(connector.start_count(), 1);

    // The recovery reset the poll clock, so no second cycle fires.
    assert!(!listener.check_poll_guard().await.expect("guard"));
    assert_eq!(connector.stop_count(), 1);
    assert_eq!(connector.start_count(), 1);

    // A stall is tolerated while a message is mid-processing.
    let guard = listener.begin_processing();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(!listener.check_poll_guard().await.expect("guard"));
    assert_eq!(connector.stop_count(), 1);

    // Once processing finishes the stall is acted on again.
    drop(guard);
    assert!(listener.check_poll_guard().await.expect("guard"));
    assert_eq!(connector.stop_count(), 2);
    assert_eq!(connector.start_count(), 2);
}

#[tokio::test]
async fn push_listener_lifecycle_runs_connector() {
    let harness = Harness::new();
    let config = EndpointConfig::new("push-lc", "qcf.pushlc", "pushed");
    let source = harness.source("qcf.pushlc", SourcePolicy::default()).await;
    let facade = harness.facade(source, config);
    let connector = Arc::new(CountingConnector::new());
    let listener = Arc::new(PushingListener::new(
        facade,
        ListenerSettings::default(),
        Arc::clone(&connector) as Arc<dyn mqbridge_core::ListenerConnector>,
    ));

    listener.open().await.expect("open");
    assert!(listener.run_state().is_started());
    assert_eq!(connector.start_count(), 1);

    // A fresh poll means the guard stays quiet.
    listener.record_poll_finished();
    assert!(!listener.check_poll_guard().await.expect("guard"));

    listener.close().await.expect("close");
    assert_eq!(listener.run_state().get(), RunState::Stopped);
    assert_eq!(connector.stop_count(), 1);
}

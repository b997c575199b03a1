//! Connection-source sharing and teardown across multiple endpoints.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::Harness;
use mqbridge_core::testing::FakeCredentialResolver;
use mqbridge_core::{
    AcknowledgeMode, BridgeError, Credentials, EndpointConfig, SourcePolicy,
};

#[tokio::test]
async fn shared_connection_closed_exactly_once() {
    let harness = Harness::new();
    let policy = SourcePolicy::default();

    // Three endpoints naming the same factory share one source.
    let s1 = harness.source("qcf.main", policy).await;
    let s2 = harness.source("qcf.main", policy).await;
    let s3 = harness.source("qcf.main", policy).await;
    assert!(Arc::ptr_eq(&s1, &s2));
    assert!(Arc::ptr_eq(&s2, &s3));
    assert_eq!(s1.reference_count().await, 3);

    // Force the shared connection open.
    let session = s1
        .create_session(false, AcknowledgeMode::Auto)
        .await
        .expect("session");
    s1.release_session(session).await;
    assert_eq!(harness.broker.connections_opened.load(Ordering::SeqCst), 1);

    // Two of three endpoints close: the connection stays up.
    assert!(!s1.close().await.expect("close"));
    assert!(!s2.close().await.expect("close"));
    assert_eq!(harness.broker.connections_closed.load(Ordering::SeqCst), 0);
    assert!(harness.registry.contains("qcf.main"));

    // The last close tears down and removes the source from the registry.
    assert!(s3.close().await.expect("close"));
    assert_eq!(harness.broker.connections_closed.load(Ordering::SeqCst), 1);
    assert!(!harness.registry.contains("qcf.main"));

    // A stray extra close does not double-free.
    assert!(!s3.close().await.expect("close"));
    assert_eq!(harness.broker.connections_closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_first_use_creates_one_source() {
    let harness = Harness::new();
    let mut handles = Vec::new();
    for _ in 0..10 {
        let registry = Arc::clone(&harness.registry);
        let resolver = harness.broker.factory_resolver();
        handles.push(tokio::spawn(async move {
            registry
                .get_or_create("qcf.race", resolver.as_ref(), None, SourcePolicy::default())
                .await
                .expect("source")
        }));
    }

    let mut sources = Vec::new();
    for handle in handles {
        sources.push(handle.await.expect("join"));
    }
    for source in &sources[1..] {
        assert!(Arc::ptr_eq(&sources[0], source));
    }
    assert_eq!(harness.registry.len(), 1);
    assert_eq!(sources[0].reference_count().await, 10);
}

#[tokio::test]
async fn pooled_sessions_get_their_own_connection() {
    let harness = Harness::new();
    let policy = SourcePolicy {
        connections_are_pooled: true,
        ..SourcePolicy::default()
    };
    let source = harness.source("qcf.pooled", policy).await;

    let a = source
        .create_session(false, AcknowledgeMode::Auto)
        .await
        .expect("session");
    let b = source
        .create_session(false, AcknowledgeMode::Auto)
        .await
        .expect("session");
    assert_eq!(harness.broker.connections_opened.load(Ordering::SeqCst), 2);

    // Releasing a pooled session closes its paired connection.
    source.release_session(a).await;
    assert_eq!(harness.broker.connections_closed.load(Ordering::SeqCst), 1);
    source.release_session(b).await;
    assert_eq!(harness.broker.connections_closed.load(Ordering::SeqCst), 2);

    source.close().await.expect("close");
}

#[tokio::test]
async fn reply_destination_shared_only_without_pooling() {
    let harness = Harness::new();

    // Unpooled: one shared dynamic reply destination per source.
    let shared = harness.source("qcf.shared", SourcePolicy::default()).await;
    let session = shared
        .create_session(false, AcknowledgeMode::Auto)
        .await
        .expect("session");
    let d1 = shared
        .get_dynamic_reply_destination(&session)
        .await
        .expect("reply destination");
    let d2 = shared
        .get_dynamic_reply_destination(&session)
        .await
        .expect("reply destination");
    assert_eq!(d1, d2);
    shared.release_session(session).await;

    // Pooled connections: temporary destinations are connection-scoped, so
    // every request gets its own.
    let pooled_policy = SourcePolicy {
        connections_are_pooled: true,
        use_single_dynamic_reply_queue: true,
        ..SourcePolicy::default()
    };
    let pooled = harness.source("qcf.perop", pooled_policy).await;
    let session = pooled
        .create_session(false, AcknowledgeMode::Auto)
        .await
        .expect("session");
    let d1 = pooled
        .get_dynamic_reply_destination(&session)
        .await
        .expect("reply destination");
    let d2 = pooled
        .get_dynamic_reply_destination(&session)
        .await
        .expect("reply destination");
    assert_ne!(d1, d2);

    pooled.release_dynamic_reply_destination(&session, &d1).await;
    pooled.release_dynamic_reply_destination(&session, &d2).await;
    assert_eq!(harness.broker.temporaries_deleted.load(Ordering::SeqCst), 2);
    pooled.release_session(session).await;

    shared.close().await.expect("close");
    pooled.close().await.expect("close");
}

#[tokio::test]
async fn auth_alias_resolves_to_connection_credentials() {
    let harness = Harness::new();
    let credential_resolver = FakeCredentialResolver::new()
        .with_alias("broker-svc", Credentials::new("svc", "hunter2"));
    let factory_resolver = harness.broker.factory_resolver();

    let mut config = EndpointConfig::new("secure-out", "qcf.secure", "secure");
    config.auth_alias = Some("broker-svc".to_string());
    let source = harness
        .registry
        .get_or_create_for_endpoint(
            &config,
            factory_resolver.as_ref(),
            Some(&credential_resolver),
            SourcePolicy::default(),
        )
        .await
        .expect("source");

    let session = source
        .create_session(false, AcknowledgeMode::Auto)
        .await
        .expect("session");
    assert_eq!(
        harness.broker.last_credentials(),
        Some(Credentials::new("svc", "hunter2"))
    );
    source.release_session(session).await;
    source.close().await.expect("close");
}

#[tokio::test]
async fn unresolvable_auth_alias_fails_at_setup() {
    let harness = Harness::new();
    let credential_resolver = FakeCredentialResolver::new();
    let factory_resolver = harness.broker.factory_resolver();

    let mut config = EndpointConfig::new("secure-out", "qcf.noalias", "secure");
    config.auth_alias = Some("nobody".to_string());

    let err = harness
        .registry
        .get_or_create_for_endpoint(
            &config,
            factory_resolver.as_ref(),
            Some(&credential_resolver),
            SourcePolicy::default(),
        )
        .await
        .expect_err("unknown alias must fail");
    assert!(matches!(err, BridgeError::Configuration { .. }));

    // No alias configured, no resolver needed.
    let config = EndpointConfig::new("plain-out", "qcf.noalias", "plain");
    let source = harness
        .registry
        .get_or_create_for_endpoint(
            &config,
            factory_resolver.as_ref(),
            None,
            SourcePolicy::default(),
        )
        .await
        .expect("source without alias");
    source.close().await.expect("close");
}

#[tokio::test]
async fn final_close_deletes_shared_reply_destination() {
    let harness = Harness::new();
    let source = harness.source("qcf.cleanup", SourcePolicy::default()).await;

    let session = source
        .create_session(false, AcknowledgeMode::Auto)
        .await
        .expect("session");
    let reply = source
        .get_dynamic_reply_destination(&session)
        .await
        .expect("reply destination");
    assert!(reply.temporary);
    source.release_session(session).await;

    assert!(source.close().await.expect("close"));
    assert_eq!(harness.broker.temporaries_deleted.load(Ordering::SeqCst), 1);
    assert_eq!(harness.broker.queue_depth(&reply.name), 0);
}

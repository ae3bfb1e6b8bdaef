//! Batch handler behavior over real providers and a scripted transport.

mod common;

use common::{blob_only, transactional_only, Harness, MockResponse, MockTransport, ScriptedProvider, IKEY};
use offline_batch_handler::{BatchHandler, JSON_STREAM_CONTENT_TYPE};
use offline_config_and_utils::OfflineChannelConfig;
use offline_core::{BatchSendState, DropReason, Payload, PersistenceLevel, ProviderKind, TelemetryEvent};
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn batch(body: &str) -> TelemetryEvent {
    TelemetryEvent::new(IKEY, PersistenceLevel::Normal, body)
}

async fn handler(harness: &Harness, config: OfflineChannelConfig) -> BatchHandler {
    let handler = BatchHandler::new();
    assert!(handler.initialize(&harness.context(config)).await);
    handler
}

#[tokio::test]
async fn blob_primary_serves_as_its_own_unload_provider() {
    let harness = Harness::new();
    let handler = handler(&harness, blob_only()).await;

    assert_eq!(handler.primary_kind(), Some(ProviderKind::Blob));
    assert_eq!(handler.unload_kind(), Some(ProviderKind::Blob));
}

#[tokio::test]
async fn async_primary_gets_blob_unload_fallback() {
    let harness = Harness::new();
    let handler = handler(&harness, transactional_only()).await;

    assert_eq!(handler.primary_kind(), Some(ProviderKind::Transactional));
    assert_eq!(handler.unload_kind(), Some(ProviderKind::Blob));
}

#[tokio::test]
async fn store_then_send_delivers_and_empties_storage() {
    let harness = Harness::new();
    let handler = handler(&harness, blob_only()).await;
    let transport = MockTransport::new();

    let stored = handler.store_batch(batch("{\"name\":\"a\"}"), false).await;
    assert!(stored.is_success());
    assert!(stored.item.has_id());
    assert!(handler.has_stored_batch().await);
    assert_eq!(harness.listener.stored(), 1);

    let outcome = handler.send_next_batch(&transport, false, 1).await;
    assert_eq!(outcome.state, BatchSendState::Complete);
    assert_eq!(outcome.status, Some(200));
    assert_eq!(outcome.data.len(), 1);
    assert_eq!(outcome.data[0].id, stored.item.id);
    assert_eq!(outcome.data[0].attempt_cnt, 1);

    let received = transport.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].url, common::ENDPOINT);
    assert_eq!(received[0].body, Payload::from("{\"name\":\"a\"}"));
    assert_eq!(received[0].headers["content-type"], JSON_STREAM_CONTENT_TYPE);
    assert_eq!(received[0].headers["apikey"], IKEY);

    assert!(!handler.has_stored_batch().await);
    assert_eq!(harness.listener.sent().len(), 1);
}

#[tokio::test]
async fn nothing_pending_completes_without_sending() {
    let harness = Harness::new();
    let handler = handler(&harness, blob_only()).await;
    let transport = MockTransport::new();

    let outcome = handler.send_next_batch(&transport, false, 1).await;
    assert!(outcome.is_complete());
    assert!(!outcome.has_data());
    assert_eq!(transport.received_count(), 0);
}

#[tokio::test]
async fn unload_entries_are_sent_before_primary_entries() {
    let harness = Harness::new();
    let handler = handler(&harness, transactional_only()).await;
    let transport = MockTransport::new();

    let primary = handler.store_batch(batch("primary"), false).await;
    harness.clock.advance(10);
    let unload = handler.store_batch(batch("unload"), true).await;
    assert!(primary.is_success() && unload.is_success());

    let first = handler.send_next_batch(&transport, false, 1).await;
    assert_eq!(first.data[0].id, unload.item.id);

    let second = handler.send_next_batch(&transport, false, 1).await;
    assert_eq!(second.data[0].id, primary.item.id);

    assert!(!handler.has_stored_batch().await);
}

#[tokio::test]
async fn retriable_status_requeues_in_unload_provider_until_ceiling() {
    let harness = Harness::new();
    let config = OfflineChannelConfig {
        retry_codes: Some(vec![500]),
        max_retry: 2,
        ..transactional_only()
    };
    let handler = handler(&harness, config).await;
    let transport = MockTransport::new();
    transport.set_default_response(MockResponse::Status(500));

    let stored = handler.store_batch(batch("payload"), false).await;

    let first = handler.send_next_batch(&transport, false, 1).await;
    assert_eq!(first.state, BatchSendState::Retry);
    assert_eq!(first.data[0].attempt_cnt, 1);
    // moved out of the primary into the unload provider
    assert!(!handler.has_stored_batch().await);

    let second = handler.send_next_batch(&transport, false, 1).await;
    assert_eq!(second.state, BatchSendState::Retry);
    assert_eq!(second.data[0].id, stored.item.id);
    assert_eq!(second.data[0].attempt_cnt, 2);

    let third = handler.send_next_batch(&transport, false, 1).await;
    assert_eq!(third.state, BatchSendState::Drop);
    assert_eq!(third.status, Some(500));
    assert_eq!(harness.listener.drops(), vec![(1, DropReason::MaxRetryExceeded)]);

    let after = handler.send_next_batch(&transport, false, 1).await;
    assert!(!after.has_data());
    assert_eq!(transport.received_count(), 3);
}

#[tokio::test]
async fn non_retriable_status_drops_immediately() {
    let harness = Harness::new();
    let handler = handler(&harness, blob_only()).await;
    let transport = MockTransport::new();
    transport.queue_response(MockResponse::Status(400));

    handler.store_batch(batch("bad"), false).await;
    let outcome = handler.send_next_batch(&transport, false, 1).await;

    assert_eq!(outcome.state, BatchSendState::Drop);
    assert_eq!(harness.listener.drops(), vec![(1, DropReason::NonRetryableStatus)]);
    assert!(!handler.has_stored_batch().await);
}

#[tokio::test]
async fn network_error_is_retried() {
    let harness = Harness::new();
    let handler = handler(&harness, blob_only()).await;
    let transport = MockTransport::new();
    transport.queue_response(MockResponse::NetworkError);

    handler.store_batch(batch("x"), false).await;
    let outcome = handler.send_next_batch(&transport, false, 1).await;
    assert_eq!(outcome.state, BatchSendState::Retry);
    assert_eq!(outcome.status, None);
    assert!(handler.has_stored_batch().await);

    let outcome = handler.send_next_batch(&transport, false, 1).await;
    assert!(outcome.is_complete());
    assert_eq!(outcome.data[0].attempt_cnt, 2);
}

#[tokio::test]
async fn multi_item_send_aggregates_verdicts() {
    let harness = Harness::new();
    let handler = handler(&harness, blob_only()).await;
    let transport = MockTransport::new();

    handler.store_batch(batch("a"), false).await;
    harness.clock.advance(1);
    handler.store_batch(batch("b"), false).await;

    transport.queue_response(MockResponse::Status(200));
    transport.queue_response(MockResponse::Status(404));
    let outcome = handler.send_next_batch(&transport, false, 2).await;

    assert_eq!(outcome.state, BatchSendState::Drop);
    assert_eq!(outcome.data.len(), 2);
    assert_eq!(transport.received_count(), 2);
    assert!(!handler.has_stored_batch().await);
}

#[tokio::test]
async fn failed_removal_resolves_failure_without_sending() {
    let harness = Harness::new();
    let custom = Arc::new(ScriptedProvider::new(true, true));
    let handler = BatchHandler::new().with_custom_provider(custom.clone());
    assert!(handler.initialize(&harness.context(blob_only())).await);

    handler.store_batch(batch("x"), false).await;
    custom.fail_remove.store(true, Ordering::SeqCst);

    let transport = MockTransport::new();
    let outcome = handler.send_next_batch(&transport, false, 1).await;
    assert_eq!(outcome.state, BatchSendState::Failure);
    assert_eq!(outcome.data.len(), 1);
    assert_eq!(transport.received_count(), 0);
    assert!(handler.has_stored_batch().await);
}

#[tokio::test]
async fn custom_provider_takes_precedence_when_it_initializes() {
    let harness = Harness::new();
    let handler = BatchHandler::new().with_custom_provider(Arc::new(ScriptedProvider::new(true, false)));
    assert!(handler.initialize(&harness.context(transactional_only())).await);

    assert_eq!(handler.primary_kind(), Some(ProviderKind::Custom));
    // custom primary is not sync, so unload falls back to a blob provider
    assert_eq!(handler.unload_kind(), Some(ProviderKind::Blob));
}

#[tokio::test]
async fn failing_custom_provider_falls_back_to_preferences() {
    let harness = Harness::new();
    let handler = BatchHandler::new().with_custom_provider(Arc::new(ScriptedProvider::new(false, true)));
    assert!(handler.initialize(&harness.context(transactional_only())).await);

    assert_eq!(handler.primary_kind(), Some(ProviderKind::Transactional));
}

#[tokio::test]
async fn custom_unload_provider_used_only_when_sync() {
    let harness = Harness::new();

    let sync_unload = BatchHandler::new().with_custom_unload_provider(Arc::new(ScriptedProvider::new(true, true)));
    assert!(sync_unload.initialize(&harness.context(transactional_only())).await);
    assert_eq!(sync_unload.unload_kind(), Some(ProviderKind::Custom));
    sync_unload.teardown().await;

    let async_unload = BatchHandler::new().with_custom_unload_provider(Arc::new(ScriptedProvider::new(true, false)));
    assert!(async_unload.initialize(&harness.context(transactional_only())).await);
    assert_eq!(async_unload.unload_kind(), Some(ProviderKind::Blob));
}

#[tokio::test]
async fn no_usable_provider_disables_persistence() {
    let harness = Harness::new();
    let config = OfflineChannelConfig {
        providers: Vec::new(),
        ..OfflineChannelConfig::default()
    };
    let handler = BatchHandler::new();
    assert!(!handler.initialize(&harness.context(config)).await);

    let item = batch("x");
    let outcome = handler.store_batch(item.clone(), false).await;
    assert!(!outcome.is_success());
    assert_eq!(outcome.item, item);

    let sent = handler.send_next_batch(&MockTransport::new(), false, 1).await;
    assert!(sent.is_complete() && !sent.has_data());
}

#[tokio::test]
async fn clean_storage_reports_removed_count_and_teardown_resets() {
    let harness = Harness::new();
    let handler = handler(&harness, blob_only()).await;

    handler.store_batch(batch("a"), false).await;
    harness.clock.advance(1);
    handler.store_batch(batch("b"), false).await;

    assert_eq!(handler.clean_storage().await.dropped_count, 2);
    assert!(!handler.has_stored_batch().await);

    handler.teardown().await;
    assert!(!handler.is_initialized());
    assert!(!handler.store_batch(batch("c"), false).await.is_success());
}

#[tokio::test]
async fn purge_expired_cleans_primary_and_unload() {
    let harness = Harness::new();
    let config = OfflineChannelConfig {
        in_storage_max_time_ms: 5_000,
        ..transactional_only()
    };
    let handler = handler(&harness, config).await;

    handler.store_batch(batch("primary"), false).await;
    handler.store_batch(batch("unload"), true).await;
    assert!(!handler.purge_expired().await);

    harness.clock.advance(10_000);
    assert!(handler.purge_expired().await);
    assert_eq!(
        harness.listener.drops(),
        vec![(1, DropReason::MaxAgeExceeded), (1, DropReason::MaxAgeExceeded)]
    );

    let outcome = handler.send_next_batch(&MockTransport::new(), false, 1).await;
    assert!(!outcome.has_data());
}

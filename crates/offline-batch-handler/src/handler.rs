//! Routing of store/send/clean requests to the selected storage providers.

use crate::retry::{RetryPolicy, SendVerdict};
use crate::transport::{SendRequest, Transport};
use offline_core::{
    BatchCleanOutcome, BatchSendOutcome, BatchSendState, BatchStoreOutcome, DropReason,
    NotificationManager, ProviderKind, TelemetryEvent,
};
use offline_storage::{create_provider, BlobStorageProvider, ProviderContext, StorageProvider};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

#[derive(Clone)]
struct Selected {
    primary: Arc<dyn StorageProvider>,
    unload: Arc<dyn StorageProvider>,
    /// The unload provider is the primary itself.
    shared: bool,
    endpoint: String,
    retry: RetryPolicy,
    notifier: NotificationManager,
}

/// Store/send front end over a primary provider and an unload-capable one.
///
/// All public operations resolve to an outcome value; provider and transport
/// errors are logged and mapped, never returned.
pub struct BatchHandler {
    custom_provider: Option<Arc<dyn StorageProvider>>,
    custom_unload_provider: Option<Arc<dyn StorageProvider>>,
    selected: RwLock<Option<Selected>>,
}

impl Default for BatchHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchHandler {
    pub fn new() -> Self {
        Self {
            custom_provider: None,
            custom_unload_provider: None,
            selected: RwLock::new(None),
        }
    }

    /// Provider tried before the configured preference list.
    pub fn with_custom_provider(mut self, provider: Arc<dyn StorageProvider>) -> Self {
        self.custom_provider = Some(provider);
        self
    }

    /// Provider used for synchronous stores, if it supports them.
    pub fn with_custom_unload_provider(mut self, provider: Arc<dyn StorageProvider>) -> Self {
        self.custom_unload_provider = Some(provider);
        self
    }

    /// Select and initialize providers. Returns false when nothing could be
    /// initialized, in which case persistence stays disabled.
    pub async fn initialize(&self, ctx: &ProviderContext) -> bool {
        let Some(primary) = self.select_primary(ctx).await else {
            warn!(endpoint = %ctx.endpoint, "No storage provider available, persistence disabled");
            self.set_selected(None);
            return false;
        };

        let (unload, shared) = self.select_unload(ctx, &primary).await;
        info!(
            primary = %primary.kind(),
            unload = %unload.kind(),
            shared,
            "Batch handler initialized"
        );

        self.set_selected(Some(Selected {
            primary,
            unload,
            shared,
            endpoint: ctx.endpoint.clone(),
            retry: RetryPolicy::from_config(&ctx.config),
            notifier: ctx.notifier.clone(),
        }));
        true
    }

    async fn select_primary(&self, ctx: &ProviderContext) -> Option<Arc<dyn StorageProvider>> {
        if let Some(custom) = &self.custom_provider {
            if custom.initialize(ctx).await {
                return Some(custom.clone());
            }
            warn!("Custom storage provider failed to initialize, using preferences");
        }

        for kind in ctx.config.provider_preferences() {
            let Some(provider) = create_provider(*kind) else {
                continue;
            };
            if provider.initialize(ctx).await {
                return Some(provider);
            }
            warn!(provider = %kind, "Storage provider failed to initialize, trying next");
        }
        None
    }

    async fn select_unload(
        &self,
        ctx: &ProviderContext,
        primary: &Arc<dyn StorageProvider>,
    ) -> (Arc<dyn StorageProvider>, bool) {
        if let Some(custom) = &self.custom_unload_provider {
            if custom.supports_sync_requests() && custom.initialize(ctx).await {
                return (custom.clone(), false);
            }
            debug!("Custom unload provider unusable, falling back");
        }

        if primary.supports_sync_requests() {
            return (primary.clone(), true);
        }

        let blob: Arc<dyn StorageProvider> = Arc::new(BlobStorageProvider::new());
        if blob.initialize(ctx).await {
            (blob, false)
        } else {
            warn!("Blob fallback failed to initialize, unload stores go to the primary");
            (primary.clone(), true)
        }
    }

    fn set_selected(&self, selected: Option<Selected>) {
        if let Ok(mut guard) = self.selected.write() {
            *guard = selected;
        }
    }

    fn selected(&self) -> Option<Selected> {
        self.selected.read().ok().and_then(|guard| guard.clone())
    }

    pub fn is_initialized(&self) -> bool {
        self.selected().is_some()
    }

    pub fn primary_kind(&self) -> Option<ProviderKind> {
        self.selected().map(|s| s.primary.kind())
    }

    pub fn unload_kind(&self) -> Option<ProviderKind> {
        self.selected().map(|s| s.unload.kind())
    }

    /// Persist one item. `sync` routes it to the unload-capable provider.
    pub async fn store_batch(&self, item: TelemetryEvent, sync: bool) -> BatchStoreOutcome {
        let Some(selected) = self.selected() else {
            debug!("Store requested without a provider");
            return BatchStoreOutcome::failure(item);
        };

        let provider = if sync { &selected.unload } else { &selected.primary };
        let key = item.id.clone();
        match provider.add_event(&key, item.clone()).await {
            Ok(stored) => {
                selected.notifier.offline_events_stored(std::slice::from_ref(&stored));
                BatchStoreOutcome::success(stored)
            }
            Err(e) => {
                warn!(provider = %provider.kind(), sync, error = %e, "Failed to store batch");
                BatchStoreOutcome::failure(item)
            }
        }
    }

    /// Deliver up to `cnt` stored items through `transport`.
    ///
    /// Items pending in the unload provider go first. Items are removed from
    /// storage before sending; retriable failures are re-added to the
    /// unload provider.
    pub async fn send_next_batch(
        &self,
        transport: &dyn Transport,
        sync: bool,
        cnt: usize,
    ) -> BatchSendOutcome {
        let Some(selected) = self.selected() else {
            return BatchSendOutcome::no_data();
        };
        let cnt = cnt.max(1);

        let mut provider = &selected.primary;
        let mut batch = Vec::new();
        if !selected.shared {
            batch = fetch(&selected.unload, cnt).await;
            if !batch.is_empty() {
                provider = &selected.unload;
            }
        }
        if batch.is_empty() {
            batch = fetch(&selected.primary, cnt).await;
        }
        if batch.is_empty() {
            return BatchSendOutcome::no_data();
        }

        let removed = match provider.remove_events(&batch).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(provider = %provider.kind(), error = %e, "Failed to remove batch before send");
                return BatchSendOutcome::failure(batch);
            }
        };
        if removed.is_empty() {
            debug!("Batch was removed concurrently, nothing to send");
            return BatchSendOutcome::no_data();
        }

        let mut verdicts = Vec::with_capacity(removed.len());
        let mut sent = Vec::with_capacity(removed.len());
        let mut last_status = None;

        for mut item in removed {
            item.attempt_cnt += 1;
            let request = SendRequest::for_event(&selected.endpoint, &item);
            let status = match transport.send_post(request, sync).await {
                Ok(response) => Some(response.status),
                Err(e) => {
                    warn!(id = %item.id, error = %e, "Transport failed");
                    None
                }
            };
            last_status = status.or(last_status);

            let verdict = selected.retry.classify(status, item.attempt_cnt);
            match verdict {
                SendVerdict::Complete => {
                    debug!(id = %item.id, "Stored batch delivered");
                }
                SendVerdict::Retry => {
                    debug!(id = %item.id, attempt = item.attempt_cnt, status = ?status, "Re-queueing batch");
                    if let Err(e) = selected.unload.add_event(&item.id, item.clone()).await {
                        warn!(id = %item.id, error = %e, "Failed to re-queue batch");
                        selected.notifier.offline_batch_drop(1, DropReason::StorageFull);
                    }
                }
                SendVerdict::Drop(reason) => {
                    info!(id = %item.id, attempt = item.attempt_cnt, status = ?status, reason = %reason, "Dropping batch");
                    selected.notifier.offline_batch_drop(1, reason);
                }
            }
            verdicts.push(verdict);
            sent.push(item);
        }

        let outcome = BatchSendOutcome {
            state: aggregate(&verdicts),
            data: sent,
            status: last_status,
        };
        selected.notifier.offline_batch_sent(&outcome);
        outcome
    }

    /// Whether the primary provider holds anything. Does not consume.
    pub async fn has_stored_batch(&self) -> bool {
        let Some(selected) = self.selected() else {
            return false;
        };
        match selected.primary.get_next_batch().await {
            Ok(batch) => !batch.is_empty(),
            Err(e) => {
                warn!(error = %e, "Failed to peek stored batch");
                false
            }
        }
    }

    /// Remove everything from the primary provider.
    pub async fn clean_storage(&self) -> BatchCleanOutcome {
        let Some(selected) = self.selected() else {
            return BatchCleanOutcome::default();
        };
        match selected.primary.clear().await {
            Ok(removed) => {
                info!(dropped = removed.len(), "Offline storage cleared");
                BatchCleanOutcome {
                    dropped_count: removed.len(),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to clear offline storage");
                BatchCleanOutcome::default()
            }
        }
    }

    /// Purge aged entries from the selected providers and let them sweep
    /// abandoned scopes. Returns whether anything was removed or adopted.
    pub async fn purge_expired(&self) -> bool {
        let Some(selected) = self.selected() else {
            return false;
        };
        let mut changed = clean_provider(&selected.primary).await;
        if !selected.shared {
            changed |= clean_provider(&selected.unload).await;
        }
        changed
    }

    /// Tear down the selected providers and forget them.
    pub async fn teardown(&self) {
        let selected = self.selected.write().ok().and_then(|mut guard| guard.take());
        if let Some(selected) = selected {
            selected.primary.teardown().await;
            if !selected.shared {
                selected.unload.teardown().await;
            }
            debug!("Batch handler torn down");
        }
    }
}

async fn fetch(provider: &Arc<dyn StorageProvider>, cnt: usize) -> Vec<TelemetryEvent> {
    let result = if cnt == 1 {
        provider.get_next_batch().await
    } else {
        provider.get_all_events(Some(cnt)).await
    };
    result.unwrap_or_else(|e| {
        warn!(provider = %provider.kind(), error = %e, "Failed to read stored batch");
        Vec::new()
    })
}

async fn clean_provider(provider: &Arc<dyn StorageProvider>) -> bool {
    match provider.clean(false).await {
        Ok(changed) => changed,
        Err(e) => {
            warn!(provider = %provider.kind(), error = %e, "Failed to purge aged events");
            false
        }
    }
}

/// All delivered: Complete. Any transient failure: Retry. Otherwise Drop.
fn aggregate(verdicts: &[SendVerdict]) -> BatchSendState {
    if verdicts.iter().all(|v| *v == SendVerdict::Complete) {
        BatchSendState::Complete
    } else if verdicts.contains(&SendVerdict::Retry) {
        BatchSendState::Retry
    } else {
        BatchSendState::Drop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate() {
        use SendVerdict::*;
        let drop = Drop(DropReason::NonRetryableStatus);

        assert_eq!(aggregate(&[Complete, Complete]), BatchSendState::Complete);
        assert_eq!(aggregate(&[Complete, Retry, drop]), BatchSendState::Retry);
        assert_eq!(aggregate(&[Complete, drop]), BatchSendState::Drop);
        assert_eq!(aggregate(&[drop]), BatchSendState::Drop);
    }

    #[tokio::test]
    async fn test_uninitialized_handler_resolves_outcomes() {
        let handler = BatchHandler::new();
        assert!(!handler.is_initialized());
        assert!(!handler.has_stored_batch().await);
        assert_eq!(handler.clean_storage().await.dropped_count, 0);

        let item = TelemetryEvent::new("k", offline_core::PersistenceLevel::Normal, "x");
        let outcome = handler.store_batch(item.clone(), false).await;
        assert!(!outcome.is_success());
        assert_eq!(outcome.item, item);
    }
}

//! Coalescing write-behind for data-plane usage counters.
//!
//! Usage increments apply in memory immediately; this task snapshots the
//! touched quota records and pushes them through the config store at a
//! bounded latency. Deltas for the same record coalesce into one write.
//! In-flight deltas are lost on crash, which the data model accepts.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::persistence::ConfigStore;
use super::store::{GovernanceDelta, GovernanceStore};

#[derive(Debug, Default)]
pub struct TouchedQuotas {
    pub budget_ids: Vec<String>,
    pub rate_limit_ids: Vec<String>,
}

impl TouchedQuotas {
    pub fn is_empty(&self) -> bool {
        self.budget_ids.is_empty() && self.rate_limit_ids.is_empty()
    }
}

pub struct UsageFlusher {
    tx: mpsc::UnboundedSender<TouchedQuotas>,
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl UsageFlusher {
    pub fn spawn(
        store: Arc<GovernanceStore>,
        config_store: Arc<dyn ConfigStore>,
        interval: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let task = tokio::spawn(run(store, config_store, rx, shutdown_rx, interval));
        Self {
            tx,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Fire-and-forget from the data plane; never blocks the request path.
    pub fn notify(&self, touched: TouchedQuotas) {
        if touched.is_empty() {
            return;
        }
        let _ = self.tx.send(touched);
    }

    /// Drains pending deltas and performs one final flush.
    pub async fn shutdown(mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for UsageFlusher {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run(
    store: Arc<GovernanceStore>,
    config_store: Arc<dyn ConfigStore>,
    mut rx: mpsc::UnboundedReceiver<TouchedQuotas>,
    mut shutdown_rx: tokio::sync::oneshot::Receiver<()>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut pending_budgets: HashSet<String> = HashSet::new();
    let mut pending_rate_limits: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            touched = rx.recv() => {
                match touched {
                    Some(touched) => {
                        pending_budgets.extend(touched.budget_ids);
                        pending_rate_limits.extend(touched.rate_limit_ids);
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => {
                flush(&store, config_store.as_ref(), &mut pending_budgets, &mut pending_rate_limits).await;
            }
            _ = &mut shutdown_rx => {
                break;
            }
        }
    }

    // Drain anything enqueued before shutdown and flush once more.
    while let Ok(touched) = rx.try_recv() {
        pending_budgets.extend(touched.budget_ids);
        pending_rate_limits.extend(touched.rate_limit_ids);
    }
    flush(
        &store,
        config_store.as_ref(),
        &mut pending_budgets,
        &mut pending_rate_limits,
    )
    .await;
}

async fn flush(
    store: &GovernanceStore,
    config_store: &dyn ConfigStore,
    pending_budgets: &mut HashSet<String>,
    pending_rate_limits: &mut HashSet<String>,
) {
    if pending_budgets.is_empty() && pending_rate_limits.is_empty() {
        return;
    }

    let mut deltas = Vec::with_capacity(pending_budgets.len() + pending_rate_limits.len());
    for id in pending_budgets.drain() {
        // The record may have been deleted since the notification; skip it.
        if let Some(budget) = store.budget_record(&id) {
            deltas.push(GovernanceDelta::UpsertBudget(budget));
        }
    }
    for id in pending_rate_limits.drain() {
        if let Some(rate_limit) = store.rate_limit_record(&id) {
            deltas.push(GovernanceDelta::UpsertRateLimit(rate_limit));
        }
    }

    if deltas.is_empty() {
        return;
    }
    if let Err(err) = config_store.apply(&deltas).await {
        tracing::warn!(error = %err, count = deltas.len(), "usage flush failed; deltas retained in memory only");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::entities::RateLimit;
    use crate::governance::persistence::MemoryConfigStore;

    #[tokio::test]
    async fn usage_reaches_config_store_within_flush_interval() {
        let store = Arc::new(GovernanceStore::new());
        let config_store = Arc::new(MemoryConfigStore::new());

        let mut limit = RateLimit::new(0);
        limit.token_max_limit = Some(1000);
        let limit_id = limit.id.clone();
        store.apply(&GovernanceDelta::UpsertRateLimit(limit));

        let flusher = UsageFlusher::spawn(
            store.clone(),
            config_store.clone(),
            Duration::from_millis(20),
        );

        // Mutate in memory, then tell the flusher which records changed.
        if let Some(mut record) = store.rate_limit_record(&limit_id) {
            record.record(0, 77);
            store.apply(&GovernanceDelta::UpsertRateLimit(record));
        }
        flusher.notify(TouchedQuotas {
            budget_ids: Vec::new(),
            rate_limit_ids: vec![limit_id.clone()],
        });

        tokio::time::sleep(Duration::from_millis(120)).await;
        let persisted = config_store.load_all().await.unwrap();
        let found = persisted.iter().any(|d| {
            matches!(d, GovernanceDelta::UpsertRateLimit(rl) if rl.id == limit_id && rl.token_current_usage == 77)
        });
        assert!(found, "usage delta should have been flushed");

        flusher.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_deltas() {
        let store = Arc::new(GovernanceStore::new());
        let config_store = Arc::new(MemoryConfigStore::new());

        let mut limit = RateLimit::new(0);
        limit.request_current_usage = 3;
        let limit_id = limit.id.clone();
        store.apply(&GovernanceDelta::UpsertRateLimit(limit));

        // Interval far beyond the test runtime: only shutdown can flush.
        let flusher =
            UsageFlusher::spawn(store.clone(), config_store.clone(), Duration::from_secs(3600));
        flusher.notify(TouchedQuotas {
            budget_ids: Vec::new(),
            rate_limit_ids: vec![limit_id.clone()],
        });
        flusher.shutdown().await;

        let persisted = config_store.load_all().await.unwrap();
        assert!(persisted.iter().any(|d| {
            matches!(d, GovernanceDelta::UpsertRateLimit(rl) if rl.id == limit_id && rl.request_current_usage == 3)
        }));
    }
}

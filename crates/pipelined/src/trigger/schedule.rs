//! Cron trigger scheduler.
//!
//! Scheduled entries live in an indexed binary min-heap keyed by next
//! run time, with a side map from `(namespace, id)` to entry ids so
//! removal is O(log n). A single loop wakes on a one-second tick or an
//! update signal and dispatches every due entry.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pipeline_core::{JsonMap, Trigger, TriggerProvider, WILDCARD_NAMESPACE};

use crate::state::{NamespacedKey, State};

use super::{Result, RunFlowFn, TriggerError};

/// Scheduler wakeup cadence when no update signal arrives.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Decoded config of a cron trigger.
#[derive(Debug, Deserialize)]
pub struct CronTriggerConfig {
    pub crons: Vec<String>,
}

pub fn decode_trigger_config(trigger: &Trigger) -> Result<CronTriggerConfig> {
    if trigger.source.config.is_null() {
        return Err(TriggerError::EmptyConfig);
    }
    Ok(serde_json::from_value(trigger.source.config.clone())?)
}

/// One scheduled occurrence source: a trigger with a parsed cron
/// expression and its next due time.
struct ScheduledEntry {
    key: NamespacedKey,
    trigger: Trigger,
    schedule: cron::Schedule,
    next_run: DateTime<Utc>,
    heap_pos: usize,
}

/// Min-heap over entry next-run times. Each entry tracks its heap
/// position, maintained on every swap, so remove-by-key stays O(log n).
#[derive(Default)]
struct TriggerHeap {
    entries: HashMap<u64, ScheduledEntry>,
    heap: Vec<u64>,
    by_key: HashMap<NamespacedKey, Vec<u64>>,
    next_id: u64,
}

impl TriggerHeap {
    fn len(&self) -> usize {
        self.heap.len()
    }

    fn push(
        &mut self,
        key: NamespacedKey,
        trigger: Trigger,
        schedule: cron::Schedule,
        next_run: DateTime<Utc>,
    ) {
        let id = self.next_id;
        self.next_id += 1;

        let entry = ScheduledEntry {
            key: key.clone(),
            trigger,
            schedule,
            next_run,
            heap_pos: self.heap.len(),
        };

        self.heap.push(id);
        self.entries.insert(id, entry);
        self.by_key.entry(key).or_default().push(id);
        self.sift_up(self.heap.len() - 1);
    }

    fn peek_next_run(&self) -> Option<DateTime<Utc>> {
        self.next_run_at(0)
    }

    fn pop(&mut self) -> Option<ScheduledEntry> {
        if self.heap.is_empty() {
            return None;
        }

        let last = self.heap.len() - 1;
        self.swap(0, last);
        let id = self.heap.pop()?;
        let entry = self.entries.remove(&id)?;

        if let Some(ids) = self.by_key.get_mut(&entry.key) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.by_key.remove(&entry.key);
            }
        }

        self.sift_down(0);
        Some(entry)
    }

    /// Remove every entry scheduled for the trigger key. Returns how many
    /// entries were removed.
    fn remove_key(&mut self, key: &NamespacedKey) -> usize {
        let Some(ids) = self.by_key.remove(key) else {
            return 0;
        };
        let removed = ids.len();
        for id in ids {
            self.remove_entry(id);
        }
        removed
    }

    fn remove_entry(&mut self, id: u64) {
        let Some(pos) = self.entries.get(&id).map(|entry| entry.heap_pos) else {
            return;
        };

        let last = self.heap.len() - 1;
        if pos != last {
            self.swap(pos, last);
        }
        self.heap.pop();
        self.entries.remove(&id);

        if pos < self.heap.len() {
            self.sift_down(pos);
            self.sift_up(pos);
        }
    }

    fn next_runs_for(&self, key: &NamespacedKey) -> Vec<DateTime<Utc>> {
        self.by_key
            .get(key)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.entries.get(id).map(|entry| entry.next_run))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn next_run_at(&self, pos: usize) -> Option<DateTime<Utc>> {
        self.heap
            .get(pos)
            .and_then(|id| self.entries.get(id))
            .map(|entry| entry.next_run)
    }

    fn less(&self, a: usize, b: usize) -> bool {
        matches!(
            (self.next_run_at(a), self.next_run_at(b)),
            (Some(x), Some(y)) if x < y
        )
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.update_pos(a);
        self.update_pos(b);
    }

    fn update_pos(&mut self, pos: usize) {
        if let Some(id) = self.heap.get(pos).copied() {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.heap_pos = pos;
            }
        }
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.less(pos, parent) {
                self.swap(pos, parent);
                pos = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        loop {
            let left = 2 * pos + 1;
            let right = 2 * pos + 2;
            let mut smallest = pos;

            if left < self.heap.len() && self.less(left, smallest) {
                smallest = left;
            }
            if right < self.heap.len() && self.less(right, smallest) {
                smallest = right;
            }
            if smallest == pos {
                return;
            }
            self.swap(pos, smallest);
            pos = smallest;
        }
    }

    /// The heap head is the minimum of all scheduled next-run times.
    #[cfg(test)]
    fn invariant_holds(&self) -> bool {
        (1..self.heap.len()).all(|pos| {
            let parent = (pos - 1) / 2;
            !self.less(pos, parent)
        })
    }
}

/// Shared pieces the scheduling loop and the API surface both touch.
struct Shared {
    heap: StdMutex<TriggerHeap>,
    run_fn: RunFlowFn,
}

impl Shared {
    /// Dispatch every due entry, rescheduling each for its next
    /// occurrence. Missed ticks collapse into a single invocation.
    fn check_due(&self, now: DateTime<Utc>) {
        let mut heap = self.heap.lock().unwrap_or_else(|e| e.into_inner());

        while let Some(next_run) = heap.peek_next_run() {
            if next_run > now {
                break;
            }
            let Some(entry) = heap.pop() else {
                break;
            };

            self.dispatch(&entry.trigger);

            match entry.schedule.after(&now).next() {
                Some(next) => {
                    debug!(
                        trigger_id = %entry.trigger.id,
                        namespace = %entry.trigger.namespace,
                        next_run = %next,
                        "rescheduled trigger"
                    );
                    heap.push(entry.key, entry.trigger, entry.schedule, next);
                }
                None => {
                    warn!(
                        trigger_id = %entry.trigger.id,
                        "cron expression has no future occurrences; dropping schedule"
                    );
                }
            }
        }
    }

    /// Launch the trigger's flow without blocking the scheduling loop.
    /// A failed launch is logged; the schedule continues.
    fn dispatch(&self, trigger: &Trigger) {
        info!(
            trigger_id = %trigger.id,
            namespace = %trigger.namespace,
            flow_id = %trigger.flow,
            "executing trigger"
        );

        let run_fn = Arc::clone(&self.run_fn);
        let trigger = trigger.clone();
        tokio::spawn(async move {
            if let Err(err) = run_fn(
                trigger.flow.clone(),
                trigger.namespace.clone(),
                trigger.id.clone(),
                JsonMap::new(),
            )
            .await
            {
                error!(
                    trigger_id = %trigger.id,
                    namespace = %trigger.namespace,
                    flow_id = %trigger.flow,
                    error = %err,
                    "failed to execute triggered flow"
                );
            }
        });
    }
}

/// Heap-based cron trigger scheduler.
pub struct CronScheduler {
    state: Arc<dyn State>,
    shared: Arc<Shared>,
    update_tx: mpsc::Sender<()>,
    update_rx: Mutex<Option<mpsc::Receiver<()>>>,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CronScheduler {
    pub fn new(state: Arc<dyn State>, run_fn: RunFlowFn) -> Self {
        let (update_tx, update_rx) = mpsc::channel(1);
        Self {
            state,
            shared: Arc::new(Shared {
                heap: StdMutex::new(TriggerHeap::default()),
                run_fn,
            }),
            update_tx,
            update_rx: Mutex::new(Some(update_rx)),
            stop: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Load stored cron triggers and start the scheduling loop.
    pub async fn start(&self) -> Result<()> {
        info!("starting trigger scheduler");
        self.hydrate().await?;

        let Some(mut update_rx) = self.update_rx.lock().await.take() else {
            return Ok(());
        };

        let shared = Arc::clone(&self.shared);
        let stop = self.stop.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = stop.cancelled() => return,
                    _ = ticker.tick() => shared.check_due(Utc::now()),
                    _ = update_rx.recv() => shared.check_due(Utc::now()),
                }
            }
        });
        *self.task.lock().await = Some(handle);

        Ok(())
    }

    pub async fn stop(&self) {
        info!("stopping trigger scheduler");
        self.stop.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
        info!("trigger scheduler stopped");
    }

    /// Parse the trigger's cron expressions and schedule one entry per
    /// expression. All expressions must parse before any is added.
    pub async fn create_trigger(&self, trigger: &Trigger) -> Result<()> {
        self.add_trigger_at(trigger, Utc::now())?;
        self.signal_update();
        Ok(())
    }

    pub(crate) fn add_trigger_at(&self, trigger: &Trigger, now: DateTime<Utc>) -> Result<()> {
        let config = decode_trigger_config(trigger)?;

        let mut schedules = Vec::with_capacity(config.crons.len());
        for expression in &config.crons {
            let schedule =
                cron::Schedule::from_str(expression).map_err(|err| TriggerError::Cron {
                    expression: expression.clone(),
                    message: err.to_string(),
                })?;
            let Some(next_run) = schedule.after(&now).next() else {
                return Err(TriggerError::Cron {
                    expression: expression.clone(),
                    message: "no future occurrences".to_string(),
                });
            };
            schedules.push((schedule, next_run));
        }

        let key = NamespacedKey::new(&trigger.namespace, &trigger.id);
        let mut heap = self.shared.heap.lock().unwrap_or_else(|e| e.into_inner());
        for (schedule, next_run) in schedules {
            info!(
                trigger_id = %trigger.id,
                namespace = %trigger.namespace,
                flow_id = %trigger.flow,
                next_run = %next_run,
                "added trigger to scheduler"
            );
            heap.push(key.clone(), trigger.clone(), schedule, next_run);
        }

        Ok(())
    }

    /// Remove every scheduled entry for the trigger.
    pub async fn delete_trigger(&self, trigger: &Trigger) -> Result<()> {
        let key = NamespacedKey::new(&trigger.namespace, &trigger.id);
        let removed = {
            let mut heap = self.shared.heap.lock().unwrap_or_else(|e| e.into_inner());
            heap.remove_key(&key)
        };

        if removed == 0 {
            return Err(TriggerError::NotFound(trigger.id.clone()));
        }

        info!(
            trigger_id = %trigger.id,
            namespace = %trigger.namespace,
            entries = removed,
            "removed trigger from scheduler"
        );
        self.signal_update();
        Ok(())
    }

    /// Earliest scheduled occurrence for a trigger, if any.
    pub fn next_run(&self, namespace: &str, id: &str) -> Option<DateTime<Utc>> {
        let heap = self.shared.heap.lock().unwrap_or_else(|e| e.into_inner());
        heap.next_runs_for(&NamespacedKey::new(namespace, id))
            .into_iter()
            .min()
    }

    #[cfg(test)]
    pub(crate) fn check_due_at(&self, now: DateTime<Utc>) {
        self.shared.check_due(now);
    }

    #[cfg(test)]
    fn scheduled_len(&self) -> usize {
        self.shared
            .heap
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn signal_update(&self) {
        // A pending signal already covers this update.
        let _ = self.update_tx.try_send(());
    }

    /// Load all stored triggers and schedule the cron ones.
    async fn hydrate(&self) -> Result<()> {
        let stubs = self.state.trigger_list(WILDCARD_NAMESPACE).await?;

        let mut loaded = 0usize;
        let mut errors = 0usize;

        for stub in &stubs {
            let trigger = match self.state.trigger_get(&stub.namespace, &stub.id).await {
                Ok(trigger) => trigger,
                Err(err) => {
                    warn!(
                        trigger_id = %stub.id,
                        namespace = %stub.namespace,
                        error = %err,
                        "failed to load trigger"
                    );
                    errors += 1;
                    continue;
                }
            };

            if trigger.source.provider != TriggerProvider::Cron {
                continue;
            }

            if let Err(err) = self.add_trigger_at(&trigger, Utc::now()) {
                warn!(
                    trigger_id = %trigger.id,
                    namespace = %trigger.namespace,
                    error = %err,
                    "failed to schedule trigger"
                );
                errors += 1;
                continue;
            }
            loaded += 1;
        }

        info!(
            loaded = loaded,
            errors = errors,
            total = stubs.len(),
            "finished loading triggers from state"
        );
        Ok(())
    }
}

impl std::fmt::Debug for CronScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronScheduler").finish_non_exhaustive()
    }
}

//! Delivery destinations and fan-out dispatch.
//!
//! The [`OutputManager`] owns every live provider together with its delivery
//! counters. `dispatch` snapshots the destination set under a read lock and
//! spawns one task per matching destination; sends to the same destination
//! are serialized by a per-destination lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::expr::{Condition, ExprError};
use crate::model::{Article, OutputDef};
use crate::plugin::{OutputProvider, PluginError, PluginRegistry, SendError};
use crate::storage::Database;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("Invalid condition: {0}")]
    Compile(#[from] ExprError),
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error("Output {0} not found")]
    NotFound(i64),
    #[error("Database error: {0}")]
    Database(String),
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// The destination already had this content; counters untouched
    Duplicate,
    Failed(String),
    TimedOut,
    /// Aborted by shutdown; counters untouched
    Cancelled,
}

/// Deliveries started by one `dispatch` call.
#[derive(Debug, Default)]
pub struct DispatchReport {
    deliveries: Vec<(i64, JoinHandle<DeliveryOutcome>)>,
}

impl DispatchReport {
    /// Number of destinations the article was routed to
    pub fn matched(&self) -> usize {
        self.deliveries.len()
    }

    /// Wait for every delivery and collect `(output_id, outcome)` pairs.
    pub async fn outcomes(self) -> Vec<(i64, DeliveryOutcome)> {
        let mut outcomes = Vec::with_capacity(self.deliveries.len());
        for (id, handle) in self.deliveries {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => DeliveryOutcome::Cancelled,
                Err(e) => DeliveryOutcome::Failed(e.to_string()),
            };
            outcomes.push((id, outcome));
        }
        outcomes
    }
}

#[derive(Default)]
struct Counters {
    success: AtomicU64,
    errors: AtomicU64,
}

/// A configured destination. Counters and the send lock survive definition
/// updates, so in-flight sends on a replaced destination still count.
struct Destination {
    def: OutputDef,
    condition: Condition,
    /// `None` when a stored definition no longer builds
    provider: Option<Arc<dyn OutputProvider>>,
    counters: Arc<Counters>,
    send_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Destination {
    fn snapshot(&self) -> OutputDef {
        OutputDef {
            success_count: self.counters.success.load(Ordering::SeqCst),
            error_count: self.counters.errors.load(Ordering::SeqCst),
            ..self.def.clone()
        }
    }
}

pub struct OutputManager {
    db: Database,
    registry: Arc<PluginRegistry>,
    send_timeout: Duration,
    destinations: RwLock<BTreeMap<i64, Arc<Destination>>>,
    tracker: TaskTracker,
    cancel: Mutex<CancellationToken>,
}

impl OutputManager {
    /// Load stored definitions and build their providers.
    ///
    /// Definitions that fail to compile or build are logged and kept, disabled.
    pub async fn load(
        db: Database,
        registry: Arc<PluginRegistry>,
        send_timeout: Duration,
    ) -> Result<Self, OutputError> {
        let defs = db
            .list_outputs()
            .await
            .map_err(|e| OutputError::Database(e.to_string()))?;

        let mut destinations = BTreeMap::new();
        for def in defs {
            let counters = Arc::new(Counters {
                success: AtomicU64::new(def.success_count),
                errors: AtomicU64::new(def.error_count),
            });
            let send_lock = Arc::new(tokio::sync::Mutex::new(()));
            let dest = match build(&registry, def.clone(), Arc::clone(&counters), Arc::clone(&send_lock)) {
                Ok(dest) => dest,
                Err(e) => {
                    tracing::warn!(output_id = def.id, alias = %def.alias, error = %e, "Output disabled: definition does not build");
                    Destination {
                        def: OutputDef {
                            enabled: false,
                            ..def
                        },
                        condition: Condition::always(),
                        provider: None,
                        counters,
                        send_lock,
                    }
                }
            };
            destinations.insert(dest.def.id, Arc::new(dest));
        }

        Ok(Self {
            db,
            registry,
            send_timeout,
            destinations: RwLock::new(destinations),
            tracker: TaskTracker::new(),
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    fn cancel_token(&self) -> CancellationToken {
        match self.cancel.lock() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Route an article to every enabled destination whose condition matches.
    ///
    /// Deliveries run as background tasks; the returned report can be awaited
    /// but does not have to be.
    pub async fn dispatch(&self, article: &Article) -> DispatchReport {
        let targets: Vec<Arc<Destination>> = {
            let destinations = self.destinations.read().await;
            destinations
                .values()
                .filter(|d| d.def.enabled && d.provider.is_some() && d.condition.matches(article))
                .cloned()
                .collect()
        };

        if targets.is_empty() {
            return DispatchReport::default();
        }

        let article = Arc::new(article.clone());
        let cancel = self.cancel_token();
        let mut report = DispatchReport::default();
        for dest in targets {
            let id = dest.def.id;
            let handle = self.tracker.spawn(deliver(
                dest,
                Arc::clone(&article),
                self.db.clone(),
                self.send_timeout,
                cancel.clone(),
            ));
            report.deliveries.push((id, handle));
        }
        report
    }

    /// Wait up to `timeout` for running deliveries. Returns false on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let drained = tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok();
        self.tracker.reopen();
        drained
    }

    /// Cancel every running delivery. Later dispatches are unaffected.
    pub fn abort_in_flight(&self) {
        let mut token = match self.cancel.lock() {
            Ok(token) => token,
            Err(poisoned) => poisoned.into_inner(),
        };
        token.cancel();
        *token = CancellationToken::new();
    }

    // ========================================================================
    // Destination management
    // ========================================================================

    pub async fn add_output(&self, def: OutputDef) -> Result<OutputDef, OutputError> {
        let counters = Arc::new(Counters::default());
        let mut dest = build(
            &self.registry,
            OutputDef {
                success_count: 0,
                error_count: 0,
                ..def
            },
            counters,
            Arc::new(tokio::sync::Mutex::new(())),
        )?;

        let mut destinations = self.destinations.write().await;
        let id = self
            .db
            .insert_output(&dest.def)
            .await
            .map_err(|e| OutputError::Database(e.to_string()))?;
        dest.def.id = id;
        let stored = dest.snapshot();
        destinations.insert(id, Arc::new(dest));

        tracing::info!(output_id = id, alias = %stored.alias, plugin = %stored.plugin, "Output added");
        Ok(stored)
    }

    /// Replace the configuration of a destination; counters are kept.
    pub async fn update_output(&self, def: OutputDef) -> Result<OutputDef, OutputError> {
        let mut destinations = self.destinations.write().await;
        let current = destinations
            .get(&def.id)
            .cloned()
            .ok_or(OutputError::NotFound(def.id))?;

        let dest = build(
            &self.registry,
            def,
            Arc::clone(&current.counters),
            Arc::clone(&current.send_lock),
        )?;
        let updated = self
            .db
            .update_output(&dest.def)
            .await
            .map_err(|e| OutputError::Database(e.to_string()))?;
        if !updated {
            return Err(OutputError::NotFound(dest.def.id));
        }

        let stored = dest.snapshot();
        destinations.insert(stored.id, Arc::new(dest));
        Ok(stored)
    }

    pub async fn remove_output(&self, id: i64) -> Result<(), OutputError> {
        let mut destinations = self.destinations.write().await;
        if !destinations.contains_key(&id) {
            return Err(OutputError::NotFound(id));
        }
        self.db
            .delete_output(id)
            .await
            .map_err(|e| OutputError::Database(e.to_string()))?;
        destinations.remove(&id);
        tracing::info!(output_id = id, "Output removed");
        Ok(())
    }

    /// Definition with live counters
    pub async fn get_output(&self, id: i64) -> Option<OutputDef> {
        self.destinations.read().await.get(&id).map(|d| d.snapshot())
    }

    pub async fn list_outputs(&self) -> Vec<OutputDef> {
        self.destinations
            .read()
            .await
            .values()
            .map(|d| d.snapshot())
            .collect()
    }
}

fn build(
    registry: &PluginRegistry,
    def: OutputDef,
    counters: Arc<Counters>,
    send_lock: Arc<tokio::sync::Mutex<()>>,
) -> Result<Destination, OutputError> {
    let condition = Condition::compile(&def.condition)?;
    let provider = registry.build_output(&def)?;
    Ok(Destination {
        def,
        condition,
        provider: Some(provider),
        counters,
        send_lock,
    })
}

async fn deliver(
    dest: Arc<Destination>,
    article: Arc<Article>,
    db: Database,
    send_timeout: Duration,
    cancel: CancellationToken,
) -> DeliveryOutcome {
    let Some(provider) = dest.provider.clone() else {
        return DeliveryOutcome::Cancelled;
    };

    let _send_guard = tokio::select! {
        _ = cancel.cancelled() => return DeliveryOutcome::Cancelled,
        guard = dest.send_lock.lock() => guard,
    };

    let outcome = tokio::select! {
        _ = cancel.cancelled() => DeliveryOutcome::Cancelled,
        result = tokio::time::timeout(send_timeout, provider.send(&article)) => match result {
            Ok(Ok(())) => DeliveryOutcome::Delivered,
            Ok(Err(SendError::DuplicateSubmission)) => DeliveryOutcome::Duplicate,
            Ok(Err(e)) => DeliveryOutcome::Failed(e.to_string()),
            Err(_) => DeliveryOutcome::TimedOut,
        },
    };

    let counted = match &outcome {
        DeliveryOutcome::Delivered => {
            dest.counters.success.fetch_add(1, Ordering::SeqCst);
            true
        }
        DeliveryOutcome::Failed(error) => {
            dest.counters.errors.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(
                output_id = dest.def.id,
                alias = %dest.def.alias,
                fingerprint = %article.fingerprint,
                error = %error,
                "Delivery failed"
            );
            true
        }
        DeliveryOutcome::TimedOut => {
            dest.counters.errors.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(
                output_id = dest.def.id,
                alias = %dest.def.alias,
                fingerprint = %article.fingerprint,
                timeout_secs = send_timeout.as_secs(),
                "Delivery timed out"
            );
            true
        }
        DeliveryOutcome::Duplicate => {
            tracing::debug!(output_id = dest.def.id, fingerprint = %article.fingerprint, "Destination reported duplicate");
            false
        }
        DeliveryOutcome::Cancelled => false,
    };

    if counted {
        let success = dest.counters.success.load(Ordering::SeqCst);
        let errors = dest.counters.errors.load(Ordering::SeqCst);
        if let Err(e) = db.update_output_counters(dest.def.id, success, errors).await {
            tracing::warn!(output_id = dest.def.id, error = %e, "Failed to persist output counters");
        }
    }

    outcome
}

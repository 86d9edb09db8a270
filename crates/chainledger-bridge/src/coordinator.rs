//! Retry coordinator — the single owner of outbound message redelivery.
//!
//! ```text
//!            dispatch ok            confirmed
//!   PENDING ────────────► SENT ────────────────► CONFIRMED
//!      ▲  │                 │
//!      │  │ attempts ≥ max  │ confirmation timeout / send error
//!      │  ▼                 │ (attempt_count + 1, backoff)
//!   FAILED ◄────────────────┘
//! ```
//!
//! A message id is claimed by `poll_due` and released by the outcome call
//! (`mark_sent`, `record_send_failure`, `mark_failed`), so one id is never
//! dispatched twice concurrently. Independent messages dispatch in parallel.
//!
//! Every transition is written to an [`OutboundStore`] before it becomes
//! visible, and [`RetryCoordinator::open`] reloads the unconfirmed set after a
//! restart. Claims are not persisted: a dispatch interrupted by a crash is sent
//! again. Confirmed messages leave both the store and the in-memory map.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use chainledger_core::error::LedgerError;
use chainledger_core::state::OutboundStore;
use chainledger_core::types::{MessageStatus, OutboundMessage};

use crate::adapter::DeliveryStatus;
use crate::retry::{BackoffPolicy, RetryConfig};
use crate::router::BridgeRouter;

/// Confirmed ids remembered after eviction, so late duplicate confirmations
/// and re-tracking stay no-ops.
const CONFIRMED_HISTORY: usize = 1_024;

#[derive(Default)]
struct State {
    messages: HashMap<String, OutboundMessage>,
    in_flight: HashSet<String>,
    recently_confirmed: VecDeque<String>,
    confirmed_total: u64,
}

/// Counts for one [`RetryCoordinator::run_once`] round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundReport {
    pub timed_out: usize,
    pub confirmed: usize,
    pub dispatched: usize,
    pub send_failures: usize,
    pub dead_lettered: usize,
}

/// Drives every tracked [`OutboundMessage`] to CONFIRMED or FAILED.
pub struct RetryCoordinator {
    config: RetryConfig,
    backoff: BackoffPolicy,
    store: Arc<dyn OutboundStore>,
    state: Mutex<State>,
}

impl RetryCoordinator {
    /// Build a coordinator over `store`, reloading every unconfirmed message.
    pub async fn open(config: RetryConfig, store: Arc<dyn OutboundStore>) -> Result<Self, LedgerError> {
        let mut messages = HashMap::new();
        for message in store.load_outbound().await? {
            if message.status == MessageStatus::Confirmed {
                store.remove_outbound(&message.message_id).await?;
                continue;
            }
            messages.insert(message.message_id.clone(), message);
        }
        if !messages.is_empty() {
            info!(recovered = messages.len(), "Recovered outbound messages");
        }
        Ok(Self {
            backoff: BackoffPolicy::from_config(&config),
            config,
            store,
            state: Mutex::new(State {
                messages,
                ..Default::default()
            }),
        })
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Start tracking a message. Returns `false` if the id is already tracked
    /// or was recently confirmed.
    pub async fn track(&self, message: OutboundMessage) -> Result<bool, LedgerError> {
        let mut state = self.state.lock().await;
        if state.messages.contains_key(&message.message_id)
            || state.recently_confirmed.contains(&message.message_id)
        {
            return Ok(false);
        }
        debug!(message_id = %message.message_id, dest_chain = message.dest_chain, "Tracking message");
        self.commit(&mut state, message).await?;
        Ok(true)
    }

    /// Current state of a tracked message. Confirmed messages are evicted and
    /// return `None`.
    pub async fn get(&self, message_id: &str) -> Option<OutboundMessage> {
        self.state.lock().await.messages.get(message_id).cloned()
    }

    /// Messages confirmed since this coordinator was opened.
    pub async fn confirmed_total(&self) -> u64 {
        self.state.lock().await.confirmed_total
    }

    /// Claim every PENDING message whose retry time has come.
    ///
    /// Claimed messages are not returned again until their outcome is recorded.
    /// A due message whose attempts already reach `max_attempts` is moved to
    /// FAILED instead of being claimed.
    pub async fn poll_due(&self, now: DateTime<Utc>) -> Result<Vec<OutboundMessage>, LedgerError> {
        self.claim_due(now).await.map(|(due, _)| due)
    }

    async fn claim_due(&self, now: DateTime<Utc>) -> Result<(Vec<OutboundMessage>, usize), LedgerError> {
        let mut state = self.state.lock().await;
        let mut candidates: Vec<OutboundMessage> = state
            .messages
            .values()
            .filter(|m| m.status == MessageStatus::Pending && m.next_retry_at <= now)
            .filter(|m| !state.in_flight.contains(&m.message_id))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.message_id.cmp(&b.message_id));

        let mut due = Vec::new();
        let mut exhausted = 0;
        for mut message in candidates {
            if message.attempt_count >= self.config.max_attempts {
                error!(
                    message_id = %message.message_id,
                    attempts = message.attempt_count,
                    max_attempts = self.config.max_attempts,
                    "Retry budget exhausted before dispatch"
                );
                message.status = MessageStatus::Failed;
                message.last_error = Some("retry budget exhausted".into());
                self.commit(&mut state, message).await?;
                exhausted += 1;
                continue;
            }
            state.in_flight.insert(message.message_id.clone());
            due.push(message);
        }
        Ok((due, exhausted))
    }

    /// Dispatch succeeded: PENDING → SENT.
    pub async fn mark_sent(
        &self,
        message_id: &str,
        receipt: String,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        state.in_flight.remove(message_id);
        let mut message = entry(&state, message_id)?;
        expect_status(&message, MessageStatus::Pending, MessageStatus::Sent)?;
        message.status = MessageStatus::Sent;
        message.receipt = Some(receipt);
        message.sent_at = Some(now);
        message.last_error = None;
        self.commit(&mut state, message).await
    }

    /// No confirmation in time: SENT → PENDING with one more attempt, or FAILED.
    pub async fn mark_timed_out(&self, message_id: &str, now: DateTime<Utc>) -> Result<MessageStatus, LedgerError> {
        let mut state = self.state.lock().await;
        let mut message = entry(&state, message_id)?;
        expect_status(&message, MessageStatus::Sent, MessageStatus::Pending)?;
        let status = self.fail_attempt(&mut message, "confirmation timed out".into(), now);
        self.commit(&mut state, message).await?;
        Ok(status)
    }

    /// Dispatch returned a retryable error: counts as a failed attempt.
    pub async fn record_send_failure(
        &self,
        message_id: &str,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<MessageStatus, LedgerError> {
        let mut state = self.state.lock().await;
        state.in_flight.remove(message_id);
        let mut message = entry(&state, message_id)?;
        expect_status(&message, MessageStatus::Pending, MessageStatus::Pending)?;
        let status = self.fail_attempt(&mut message, reason, now);
        self.commit(&mut state, message).await?;
        Ok(status)
    }

    /// Delivery confirmed: SENT → CONFIRMED. Idempotent once confirmed.
    pub async fn mark_confirmed(&self, message_id: &str) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        if state.recently_confirmed.iter().any(|id| id == message_id) {
            return Ok(());
        }
        let mut message = entry(&state, message_id)?;
        expect_status(&message, MessageStatus::Sent, MessageStatus::Confirmed)?;
        message.status = MessageStatus::Confirmed;
        info!(message_id, attempts = message.attempt_count + 1, "Message confirmed");
        self.commit(&mut state, message).await
    }

    /// Move a message straight to FAILED (dead letter).
    pub async fn mark_failed(&self, message_id: &str, reason: String) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        state.in_flight.remove(message_id);
        let mut message = entry(&state, message_id)?;
        if message.status.is_terminal() {
            return Err(transition_err(&message, MessageStatus::Failed));
        }
        error!(message_id, reason = %reason, "Message dead-lettered");
        message.status = MessageStatus::Failed;
        message.last_error = Some(reason);
        self.commit(&mut state, message).await
    }

    /// Time out every SENT message older than the confirmation timeout.
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>) -> usize {
        let timeout = chrono::Duration::milliseconds(self.config.confirmation_timeout_ms as i64);
        let expired: Vec<String> = {
            let state = self.state.lock().await;
            state
                .messages
                .values()
                .filter(|m| m.status == MessageStatus::Sent)
                .filter(|m| m.sent_at.is_some_and(|at| at + timeout <= now))
                .map(|m| m.message_id.clone())
                .collect()
        };
        let mut n = 0;
        for id in expired {
            match self.mark_timed_out(&id, now).await {
                Ok(_) => n += 1,
                Err(e) => warn!(message_id = %id, error = %e, "Could not record confirmation timeout"),
            }
        }
        n
    }

    /// Messages in the terminal FAILED state, for operator review.
    pub async fn dead_letters(&self) -> Vec<OutboundMessage> {
        self.with_status(MessageStatus::Failed).await
    }

    pub async fn with_status(&self, status: MessageStatus) -> Vec<OutboundMessage> {
        let mut out: Vec<_> = self
            .state
            .lock()
            .await
            .messages
            .values()
            .filter(|m| m.status == status)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.message_id.cmp(&b.message_id));
        out
    }

    /// One coordinator round: time out, confirm, then dispatch what is due.
    pub async fn run_once(&self, router: &BridgeRouter, now: DateTime<Utc>) -> RoundReport {
        let mut report = RoundReport {
            timed_out: self.sweep_timeouts(now).await,
            ..Default::default()
        };

        for message in self.with_status(MessageStatus::Sent).await {
            let Some(receipt) = message.receipt.as_deref() else { continue };
            match router.track_delivery(&message.protocol, receipt).await {
                Ok(DeliveryStatus::Delivered) => match self.mark_confirmed(&message.message_id).await {
                    Ok(()) => report.confirmed += 1,
                    Err(e) => warn!(message_id = %message.message_id, error = %e, "Could not record confirmation"),
                },
                Ok(DeliveryStatus::Failed(reason)) => {
                    warn!(message_id = %message.message_id, %reason, "Bridge reported delivery failure");
                    if let Ok(MessageStatus::Failed) = self.mark_timed_out(&message.message_id, now).await {
                        report.dead_lettered += 1;
                    }
                }
                Ok(DeliveryStatus::Pending) => {}
                Err(e) => {
                    debug!(message_id = %message.message_id, error = %e, "Delivery status unavailable");
                }
            }
        }

        let due = match self.claim_due(now).await {
            Ok((due, exhausted)) => {
                report.dead_lettered += exhausted;
                due
            }
            Err(e) => {
                warn!(error = %e, "Could not claim due messages");
                return report;
            }
        };
        let results = join_all(due.iter().map(|m| router.dispatch(m))).await;
        for (message, result) in due.iter().zip(results) {
            let id = &message.message_id;
            let recorded = match result {
                Ok(receipt) => {
                    report.dispatched += 1;
                    self.mark_sent(id, receipt, now).await
                }
                Err(e) if e.is_permanent() || !e.is_retryable() => {
                    report.dead_lettered += 1;
                    self.mark_failed(id, e.to_string()).await
                }
                Err(e) => {
                    report.send_failures += 1;
                    warn!(message_id = %id, attempt = message.attempt_count + 1, error = %e, "Dispatch failed");
                    match self.record_send_failure(id, e.to_string(), now).await {
                        Ok(MessageStatus::Failed) => {
                            report.dead_lettered += 1;
                            Ok(())
                        }
                        other => other.map(|_| ()),
                    }
                }
            };
            if let Err(e) = recorded {
                warn!(message_id = %id, error = %e, "Could not record dispatch outcome");
            }
        }
        report
    }

    /// Run rounds at the configured poll interval until `shutdown` flips to `true`.
    pub async fn run(&self, router: &BridgeRouter, mut shutdown: watch::Receiver<bool>) {
        let tick = Duration::from_millis(self.config.poll_interval_ms);
        info!(max_attempts = self.config.max_attempts, "Retry coordinator started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let report = self.run_once(router, Utc::now()).await;
            if report != RoundReport::default() {
                debug!(?report, "Retry round");
            }
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("Retry coordinator stopped");
    }

    /// Persist `message`, then publish it to the in-memory map. CONFIRMED
    /// messages are removed from both.
    async fn commit(&self, state: &mut State, message: OutboundMessage) -> Result<(), LedgerError> {
        if message.status == MessageStatus::Confirmed {
            self.store.remove_outbound(&message.message_id).await?;
            state.messages.remove(&message.message_id);
            if state.recently_confirmed.len() == CONFIRMED_HISTORY {
                state.recently_confirmed.pop_front();
            }
            state.recently_confirmed.push_back(message.message_id);
            state.confirmed_total += 1;
        } else {
            self.store.put_outbound(&message).await?;
            state.messages.insert(message.message_id.clone(), message);
        }
        Ok(())
    }

    /// Charge a failed attempt and schedule the retry, or dead-letter.
    fn fail_attempt(&self, message: &mut OutboundMessage, reason: String, now: DateTime<Utc>) -> MessageStatus {
        message.attempt_count += 1;
        message.last_error = Some(reason);
        if message.attempt_count >= self.config.max_attempts {
            message.status = MessageStatus::Failed;
            error!(
                message_id = %message.message_id,
                attempts = message.attempt_count,
                "{}",
                LedgerError::PermanentDeliveryFailure {
                    message_id: message.message_id.clone(),
                    attempts: message.attempt_count,
                }
            );
        } else {
            message.status = MessageStatus::Pending;
            message.next_retry_at = self.backoff.next_retry_at(now, message.attempt_count);
            debug!(
                message_id = %message.message_id,
                attempt = message.attempt_count,
                next_retry_at = %message.next_retry_at,
                "Retry scheduled"
            );
        }
        message.status
    }
}

fn entry(state: &State, message_id: &str) -> Result<OutboundMessage, LedgerError> {
    state
        .messages
        .get(message_id)
        .cloned()
        .ok_or_else(|| LedgerError::UnknownMessage(message_id.to_string()))
}

fn expect_status(message: &OutboundMessage, from: MessageStatus, to: MessageStatus) -> Result<(), LedgerError> {
    if message.status != from {
        return Err(transition_err(message, to));
    }
    Ok(())
}

fn transition_err(message: &OutboundMessage, to: MessageStatus) -> LedgerError {
    LedgerError::InvalidTransition {
        message_id: message.message_id.clone(),
        from: message.status.to_string(),
        to: to.to_string(),
    }
}

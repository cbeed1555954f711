//! Signal delivery to waiting executions.
//!
//! Each live execution owns one [`SignalSlot`]. A slot is armed before the
//! request (or job) it waits on is created, so a response can never arrive
//! before anybody is listening for it. Once the request id is known the slot
//! is bound to it; signals carrying a different id are rejected as stale.
//! Signals without an id are accepted while the slot is armed.
//!
//! The slot buffers at most one signal. A second signal before the first is
//! consumed is rejected instead of queued.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::error::OnboardingError;
use crate::types::RequestType;

/// A response to a human request, or a completion posted by an external job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub request_id: Option<String>,
    pub payload: Value,
}

impl Signal {
    /// Wrap a raw body, picking up a top-level `requestId` if present.
    pub fn from_payload(payload: Value) -> Self {
        let request_id = payload
            .get("requestId")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            request_id,
            payload,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AwaitKind {
    ReviewPlan,
    UploadCsv,
    ConfigForm,
    JobCallback,
}

impl From<RequestType> for AwaitKind {
    fn from(t: RequestType) -> Self {
        match t {
            RequestType::ReviewPlan => Self::ReviewPlan,
            RequestType::UploadCsv => Self::UploadCsv,
            RequestType::ConfigForm => Self::ConfigForm,
        }
    }
}

/// What an execution is currently waiting for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwaitedSignal {
    pub kind: AwaitKind,
    pub step_slug: String,
    pub request_id: Option<String>,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Delivery {
    Delivered,
    Stale { expected: String, received: String },
    NotAwaiting,
    SlotFull,
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

// ---------------------------------------------------------------------------
// Slot
// ---------------------------------------------------------------------------

pub struct SignalSlot {
    execution_id: String,
    game_id: Uuid,
    awaited: Mutex<Option<AwaitedSignal>>,
    tx: mpsc::Sender<Signal>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Signal>>,
}

impl SignalSlot {
    fn new(execution_id: &str, game_id: Uuid) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            execution_id: execution_id.to_string(),
            game_id,
            awaited: Mutex::new(None),
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    fn awaited_lock(&self) -> MutexGuard<'_, Option<AwaitedSignal>> {
        self.awaited.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn game_id(&self) -> Uuid {
        self.game_id
    }

    /// Start accepting signals. Anything left over from an earlier wait is dropped.
    pub fn arm(&self, kind: AwaitKind, step_slug: &str) {
        let mut awaited = self.awaited_lock();
        if let Ok(mut rx) = self.rx.try_lock() {
            while rx.try_recv().is_ok() {}
        }
        *awaited = Some(AwaitedSignal {
            kind,
            step_slug: step_slug.to_string(),
            request_id: None,
            since: Utc::now(),
        });
    }

    /// Tie the armed wait to a concrete request or job execution id.
    pub fn bind(&self, request_id: impl Into<String>) {
        if let Some(awaited) = self.awaited_lock().as_mut() {
            awaited.request_id = Some(request_id.into());
        }
    }

    pub fn disarm(&self) {
        self.awaited_lock().take();
    }

    pub fn awaited(&self) -> Option<AwaitedSignal> {
        self.awaited_lock().clone()
    }

    pub fn deliver(&self, signal: Signal) -> Delivery {
        let awaited = self.awaited_lock();
        let Some(current) = awaited.as_ref() else {
            return Delivery::NotAwaiting;
        };
        if let (Some(expected), Some(received)) = (&current.request_id, &signal.request_id) {
            if expected != received {
                return Delivery::Stale {
                    expected: expected.clone(),
                    received: received.clone(),
                };
            }
        }
        match self.tx.try_send(signal) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => Delivery::SlotFull,
            Err(TrySendError::Closed(_)) => Delivery::NotAwaiting,
        }
    }

    /// Wait for the next signal. `Ok(None)` means `timeout` elapsed first.
    ///
    /// The slot stays armed; callers disarm once they accept the payload.
    pub async fn recv(
        &self,
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> Result<Option<Signal>, OnboardingError> {
        let mut rx = cancel.checkpoint(self.rx.lock()).await?;
        let received = match timeout {
            Some(limit) => match cancel.checkpoint(tokio::time::timeout(limit, rx.recv())).await? {
                Ok(signal) => signal,
                Err(_) => return Ok(None),
            },
            None => cancel.checkpoint(rx.recv()).await?,
        };
        received
            .map(Some)
            .ok_or_else(|| OnboardingError::Internal(format!("signal channel closed for {}", self.execution_id)))
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Maps live execution ids to their slots.
#[derive(Clone, Default)]
pub struct SignalRouter {
    slots: Arc<RwLock<HashMap<String, Arc<SignalSlot>>>>,
}

impl SignalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `execution_id`. Fails when an execution with that id is already live.
    pub fn register(&self, execution_id: &str, game_id: Uuid) -> Result<SlotGuard, OnboardingError> {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if slots.contains_key(execution_id) {
            return Err(OnboardingError::AlreadyRunning {
                game_id,
                workflow_id: execution_id.to_string(),
            });
        }
        let slot = Arc::new(SignalSlot::new(execution_id, game_id));
        slots.insert(execution_id.to_string(), slot.clone());
        Ok(SlotGuard {
            router: self.clone(),
            slot,
        })
    }

    pub fn deliver(&self, execution_id: &str, signal: Signal) -> Result<Delivery, OnboardingError> {
        let slot = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(execution_id)
            .cloned()
            .ok_or_else(|| OnboardingError::ExecutionNotFound(execution_id.to_string()))?;
        let delivery = slot.deliver(signal);
        match &delivery {
            Delivery::Delivered => {
                tracing::debug!(execution_id, "signal delivered");
            }
            other => {
                tracing::warn!(execution_id, outcome = ?other, "signal rejected");
            }
        }
        Ok(delivery)
    }

    pub fn is_live(&self, execution_id: &str) -> bool {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(execution_id)
    }

    /// Live executions of one game and what each is waiting for, sorted by id.
    pub fn executions_for_game(&self, game_id: Uuid) -> Vec<(String, Option<AwaitedSignal>)> {
        let mut out: Vec<_> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| slot.game_id == game_id)
            .map(|slot| (slot.execution_id.clone(), slot.awaited()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn release(&self, slot: &Arc<SignalSlot>) {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if slots
            .get(&slot.execution_id)
            .is_some_and(|live| Arc::ptr_eq(live, slot))
        {
            slots.remove(&slot.execution_id);
        }
    }
}

/// Registration of a live execution. Dropping it frees the execution id.
pub struct SlotGuard {
    router: SignalRouter,
    slot: Arc<SignalSlot>,
}

impl Deref for SlotGuard {
    type Target = SignalSlot;

    fn deref(&self) -> &SignalSlot {
        &self.slot
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.router.release(&self.slot);
    }
}

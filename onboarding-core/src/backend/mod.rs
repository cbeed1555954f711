//! External systems the engine talks to.
//!
//! Everything outside the process (the admin API that owns the catalog,
//! progress and human requests, and the external job runner) sits behind
//! [`OnboardingBackend`]. The engine never calls these methods directly; it
//! goes through [`Activities`](crate::activities::Activities), which adds the
//! per-call timeout and retry policy.

mod http;
mod memory;

pub use http::{HttpBackend, JobRunnerEndpoint};
pub use memory::{BackendOp, MemoryBackend};

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::catalog::PlanSnapshot;
use crate::error::BackendError;
use crate::types::{JobExecution, JobTrigger, NewRequest, StatusUpdate};

#[async_trait]
pub trait OnboardingBackend: Send + Sync {
    // ── Plan and progress ──

    /// Catalog steps joined with the game's progress, plus platform configs.
    async fn get_plan(&self, game_id: Uuid) -> Result<PlanSnapshot, BackendError>;

    /// Upsert one step's progress.
    async fn update_step_status(&self, update: &StatusUpdate) -> Result<(), BackendError>;

    // ── Human requests ──

    /// Create a pending request and return its id.
    async fn create_request(&self, request: &NewRequest) -> Result<Uuid, BackendError>;

    /// Move every pending request of the game to cancelled. Returns how many moved.
    async fn cancel_pending_requests(&self, game_id: Uuid) -> Result<u64, BackendError>;

    // ── Platforms ──

    /// Stored integration config for one platform. Empty when none exists.
    async fn get_platform_config(
        &self,
        game_id: Uuid,
        platform_slug: &str,
    ) -> Result<Map<String, Value>, BackendError>;

    async fn trigger_step(&self, game_id: Uuid, step_slug: &str) -> Result<Value, BackendError>;

    // ── External jobs ──

    async fn trigger_external_job(&self, trigger: &JobTrigger)
        -> Result<JobExecution, BackendError>;

    // ── Form answers ──

    /// Store collected form answers against a target table. No-op unless a
    /// backend has somewhere to put them.
    async fn persist_form_answers(
        &self,
        _game_id: Uuid,
        _target_table: &str,
        _answers: &Map<String, Value>,
    ) -> Result<(), BackendError> {
        Ok(())
    }
}

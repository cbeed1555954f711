//! Game onboarding orchestration.
//!
//! An onboarding run takes a game through its step catalog: platform
//! configuration gates, a plan review by a human, then concurrent per-platform
//! groups of steps. Steps are CSV imports, external jobs, forms or named
//! platform activities. Human requests and job completions come back in as
//! signals routed to the waiting execution.
//!
//! ```text
//! OnboardingEngine ── start ──▶ orchestrator (onboarding-{name}-{game})
//!                                 ├── config gates / plan review   (human signals)
//!                                 └── platform groups (join_all)
//!                                       ├── csv-ingest-{game}-{slug}
//!                                       │     └── external-job-{game}-{slug}
//!                                       ├── external-job-{game}-{slug}  (job callback)
//!                                       └── form-input-{game}-{slug}
//! ```

pub mod activities;
pub mod backend;
pub mod cancel;
pub mod catalog;
pub mod config;
pub mod context;
pub mod duration;
pub mod engine;
pub mod error;
pub mod ids;
pub mod orchestrator;
pub mod patterns;
pub mod platform;
pub mod signal;
pub mod types;

pub use backend::{HttpBackend, MemoryBackend, OnboardingBackend};
pub use config::EngineConfig;
pub use context::Dependencies;
pub use engine::{InstanceState, InstanceStatus, OnboardingEngine};
pub use error::{BackendError, OnboardingError};
pub use signal::{Delivery, Signal};

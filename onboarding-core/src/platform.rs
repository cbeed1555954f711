//! Named platform activities.
//!
//! Steps with executor kind `platform_activity` name a handler by string.
//! The set of handlers is closed: it is fixed when the engine is built and
//! plans naming anything else are rejected when they are loaded.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::backend::OnboardingBackend;
use crate::error::BackendError;

/// Arguments handed to a platform activity.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityCall {
    pub game_id: Uuid,
    pub step_slug: String,
    pub workflow_id: String,
    pub params: Map<String, Value>,
}

#[async_trait]
pub trait PlatformActivity: Send + Sync {
    /// Run once. Retries and the per-call timeout are applied by the caller.
    async fn run(
        &self,
        backend: &dyn OnboardingBackend,
        call: &ActivityCall,
    ) -> Result<Value, BackendError>;
}

/// Asks the admin API to run a step server-side.
pub struct TriggerStep;

#[async_trait]
impl PlatformActivity for TriggerStep {
    async fn run(
        &self,
        backend: &dyn OnboardingBackend,
        call: &ActivityCall,
    ) -> Result<Value, BackendError> {
        backend.trigger_step(call.game_id, &call.step_slug).await
    }
}

pub const TRIGGER_STEP: &str = "trigger_step";

#[derive(Clone, Default)]
pub struct ActivityRegistry {
    handlers: HashMap<String, Arc<dyn PlatformActivity>>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(TRIGGER_STEP, Arc::new(TriggerStep));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn PlatformActivity>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PlatformActivity>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl PlatformActivity for Echo {
        async fn run(
            &self,
            _backend: &dyn OnboardingBackend,
            call: &ActivityCall,
        ) -> Result<Value, BackendError> {
            Ok(Value::Object(call.params.clone()))
        }
    }

    #[test]
    fn test_builtins_registered() {
        let registry = ActivityRegistry::with_builtins();
        assert!(registry.contains(TRIGGER_STEP));
        assert!(!registry.contains("echo"));
        assert_eq!(registry.names(), vec![TRIGGER_STEP]);
    }

    #[tokio::test]
    async fn test_custom_handler_runs() {
        let mut registry = ActivityRegistry::with_builtins();
        registry.register("echo", Arc::new(Echo));

        let backend = MemoryBackend::new();
        let mut params = Map::new();
        params.insert("region".into(), json!("eu"));
        let call = ActivityCall {
            game_id: Uuid::new_v4(),
            step_slug: "kick".into(),
            workflow_id: "onboarding-x".into(),
            params,
        };
        let out = registry.get("echo").unwrap().run(&backend, &call).await.unwrap();
        assert_eq!(out, json!({"region": "eu"}));
    }

    #[tokio::test]
    async fn test_trigger_step_calls_backend() {
        let backend = MemoryBackend::new();
        let game_id = Uuid::new_v4();
        let call = ActivityCall {
            game_id,
            step_slug: "kick".into(),
            workflow_id: "onboarding-x".into(),
            params: Map::new(),
        };
        let out = TriggerStep.run(&backend, &call).await.unwrap();
        assert_eq!(out["triggered"], true);
        assert_eq!(backend.triggered_steps(), vec![(game_id, "kick".to_string())]);
    }
}

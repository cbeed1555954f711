//! Process-level settings for the server binary.

use anyhow::{bail, Result};

pub const DEFAULT_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Http,
    /// In-process store. Nothing is persisted across restarts.
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub addr: String,
    pub backend: BackendKind,
}

impl ServerSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Reads `ONBOARDING_ADDR` and `ONBOARDING_BACKEND` (`http` | `memory`).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let addr = lookup("ONBOARDING_ADDR")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let backend = match lookup("ONBOARDING_BACKEND")
            .map(|v| v.to_lowercase())
            .as_deref()
        {
            None | Some("") | Some("http") => BackendKind::Http,
            Some("memory") => BackendKind::Memory,
            Some(other) => bail!("ONBOARDING_BACKEND must be 'http' or 'memory', got '{other}'"),
        };
        Ok(Self { addr, backend })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = ServerSettings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings.addr, DEFAULT_ADDR);
        assert_eq!(settings.backend, BackendKind::Http);
    }

    #[test]
    fn test_overrides_and_bad_backend() {
        let settings = ServerSettings::from_lookup(lookup(&[
            ("ONBOARDING_ADDR", "127.0.0.1:9000"),
            ("ONBOARDING_BACKEND", "Memory"),
        ]))
        .unwrap();
        assert_eq!(settings.addr, "127.0.0.1:9000");
        assert_eq!(settings.backend, BackendKind::Memory);

        assert!(ServerSettings::from_lookup(lookup(&[("ONBOARDING_BACKEND", "sql")])).is_err());
    }
}

//! Deterministic execution ids.
//!
//! Every id is derived from the game and a slug so that a restart or a
//! duplicate trigger lands on the same execution instead of forking a new one.

use uuid::Uuid;

/// Lowercase, spaces to dashes, everything else non-alphanumeric dropped.
pub fn slugify(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .replace(' ', "-")
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-')
        .collect()
}

/// Id of the main onboarding execution for a game.
pub fn onboarding_id(game_name: &str, game_id: Uuid) -> String {
    let slug = slugify(game_name);
    if slug.is_empty() {
        format!("onboarding-{game_id}")
    } else {
        format!("onboarding-{slug}-{game_id}")
    }
}

pub fn csv_ingest_id(game_id: Uuid, step_slug: &str) -> String {
    format!("csv-ingest-{game_id}-{step_slug}")
}

pub fn external_job_id(game_id: Uuid, step_slug: &str) -> String {
    format!("external-job-{game_id}-{step_slug}")
}

pub fn form_input_id(game_id: Uuid, step_slug: &str) -> String {
    format!("form-input-{game_id}-{step_slug}")
}

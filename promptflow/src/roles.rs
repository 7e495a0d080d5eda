//! Role definitions and registry.
//!
//! A role bundles the prompt persona and model preferences a stage runs
//! under. Roles are registered once and selected by id at
//! stage-construction time.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A role a stage or collaborative participant acts as.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSpec {
    /// Unique role id.
    pub id: String,
    /// System prompt establishing the persona.
    pub system_prompt: String,
    /// Expected output shape, appended to prompts when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_spec: Option<String>,
    /// Ordered candidate models (primary first).
    #[serde(default)]
    pub model_preferences: Vec<String>,
}

impl RoleSpec {
    /// Creates a new role spec.
    #[must_use]
    pub fn new(id: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            system_prompt: system_prompt.into(),
            output_spec: None,
            model_preferences: Vec::new(),
        }
    }

    /// Sets the output spec.
    #[must_use]
    pub fn with_output_spec(mut self, spec: impl Into<String>) -> Self {
        self.output_spec = Some(spec.into());
        self
    }

    /// Sets the ordered model preferences.
    #[must_use]
    pub fn with_model_preferences(
        mut self,
        models: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.model_preferences = models.into_iter().map(Into::into).collect();
        self
    }

    /// Candidate list for a participant, honoring a primary-model override.
    ///
    /// The override replaces the role's primary; the role's remaining
    /// preferences stay as backups.
    #[must_use]
    pub fn candidates_with_override(&self, primary_override: Option<&str>) -> Vec<String> {
        match primary_override {
            Some(primary) => {
                let mut candidates = vec![primary.to_string()];
                candidates.extend(
                    self.model_preferences
                        .iter()
                        .filter(|m| m.as_str() != primary)
                        .cloned(),
                );
                candidates
            }
            None => self.model_preferences.clone(),
        }
    }
}

/// Registry of roles, looked up by id.
#[derive(Debug, Default)]
pub struct RoleRegistry {
    roles: RwLock<HashMap<String, Arc<RoleSpec>>>,
}

impl RoleRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a role, replacing any previous role with the same id.
    pub fn register(&self, role: RoleSpec) {
        self.roles.write().insert(role.id.clone(), Arc::new(role));
    }

    /// Looks up a role by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<RoleSpec>> {
        self.roles.read().get(id).cloned()
    }

    /// Returns the number of registered roles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.roles.read().len()
    }

    /// Returns true if no roles are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roles.read().is_empty()
    }
}

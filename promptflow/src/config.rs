//! Engine configuration structures.
//!
//! Configuration is loaded externally (CLI/YAML parsing is out of scope) and
//! passed in as these already-parsed structures. [`EngineConfig::validate`]
//! rejects malformed definitions at pipeline start, before any dispatch.

use crate::errors::ConfigError;
use crate::roles::RoleRegistry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::HashSet;

/// Model invocation parameters for a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    /// Sampling temperature.
    pub temperature: f32,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Per-call deadline in seconds.
    pub timeout_seconds: f64,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2000,
            timeout_seconds: 60.0,
        }
    }
}

/// The kind of a pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// One role, one model dispatch.
    #[default]
    Standard,
    /// Multiple participants run concurrently; outputs merged by role.
    Collaborative,
}

/// One participant in a collaborative stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantSpec {
    /// Role id, resolved against the role registry.
    pub role: String,
    /// Overrides the role's primary model when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_model: Option<String>,
}

impl ParticipantSpec {
    /// Creates a participant for the given role.
    #[must_use]
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            primary_model: None,
        }
    }

    /// Overrides the primary model for this participant.
    #[must_use]
    pub fn with_primary_model(mut self, model: impl Into<String>) -> Self {
        self.primary_model = Some(model.into());
        self
    }
}

/// Lightweight schema requirement for a stage output.
///
/// The output must contain a JSON payload (fenced block or bare object)
/// carrying every listed top-level property.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaSpec {
    /// Name of the schema, for diagnostics.
    pub name: String,
    /// Required top-level properties.
    pub required: Vec<String>,
}

impl SchemaSpec {
    /// Creates a new schema spec.
    #[must_use]
    pub fn new(name: impl Into<String>, required: Vec<String>) -> Self {
        Self {
            name: name.into(),
            required,
        }
    }
}

/// Validation requirements for a stage output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSpec {
    /// Section headers that must be present.
    #[serde(default)]
    pub required_sections: Vec<String>,
    /// Patterns that must be present (matched case-insensitively).
    #[serde(default)]
    pub required_patterns: Vec<String>,
    /// Optional schema requirement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<SchemaSpec>,
    /// Output key of a prior stage to check consistency against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consistency_with: Option<String>,
    /// Minimum embedding similarity for the consistency check.
    pub consistency_threshold: f32,
    /// Whether a failure triggers a feedback retry.
    pub retry_on_failure: bool,
}

impl Default for ValidationSpec {
    fn default() -> Self {
        Self {
            required_sections: Vec::new(),
            required_patterns: Vec::new(),
            schema: None,
            consistency_with: None,
            consistency_threshold: 0.6,
            retry_on_failure: true,
        }
    }
}

impl ValidationSpec {
    /// Creates an empty validation spec.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the required sections.
    #[must_use]
    pub fn with_sections(mut self, sections: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.required_sections = sections.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the required patterns.
    #[must_use]
    pub fn with_patterns(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.required_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the schema requirement.
    #[must_use]
    pub fn with_schema(mut self, schema: SchemaSpec) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Enables the consistency check against a prior stage's output key.
    #[must_use]
    pub fn with_consistency(mut self, output_key: impl Into<String>, threshold: f32) -> Self {
        self.consistency_with = Some(output_key.into());
        self.consistency_threshold = threshold;
        self
    }

    /// Disables retries on validation failure.
    #[must_use]
    pub fn without_retry(mut self) -> Self {
        self.retry_on_failure = false;
        self
    }

    /// Returns true if no checks are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.required_sections.is_empty()
            && self.required_patterns.is_empty()
            && self.schema.is_none()
            && self.consistency_with.is_none()
    }
}

/// Static definition of a single pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Unique stage id.
    pub id: String,
    /// Stage kind.
    pub kind: StageKind,
    /// Human description of the task; also the downstream retrieval query.
    pub task: String,
    /// Role id for standard stages.
    pub role: String,
    /// Context keys consumed, in order; the first is the primary input.
    pub inputs: Vec<String>,
    /// Context key the accepted output is stored under.
    pub output: String,
    /// Ordered candidate models (primary first). Empty for collaborative
    /// stages, whose candidates come from participant roles.
    #[serde(default)]
    pub models: Vec<String>,
    /// Model invocation parameters.
    #[serde(default)]
    pub params: ModelParams,
    /// Validation requirements, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationSpec>,
    /// Maximum validation retries.
    pub max_retries: u32,
    /// Participants for collaborative stages.
    #[serde(default)]
    pub participants: Vec<ParticipantSpec>,
}

impl StageDefinition {
    /// Creates a standard stage definition.
    #[must_use]
    pub fn new(id: impl Into<String>, task: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: StageKind::Standard,
            task: task.into(),
            role: role.into(),
            inputs: Vec::new(),
            output: String::new(),
            models: Vec::new(),
            params: ModelParams::default(),
            validation: None,
            max_retries: 3,
            participants: Vec::new(),
        }
    }

    /// Sets the input keys.
    #[must_use]
    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the output key.
    #[must_use]
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    /// Sets the ordered candidate models.
    #[must_use]
    pub fn with_models(mut self, models: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the model parameters.
    #[must_use]
    pub fn with_params(mut self, params: ModelParams) -> Self {
        self.params = params;
        self
    }

    /// Sets the validation spec.
    #[must_use]
    pub fn with_validation(mut self, validation: ValidationSpec) -> Self {
        self.validation = Some(validation);
        self
    }

    /// Sets the maximum validation retries.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Marks the stage collaborative with the given participants.
    #[must_use]
    pub fn collaborative(mut self, participants: Vec<ParticipantSpec>) -> Self {
        self.kind = StageKind::Collaborative;
        self.participants = participants;
        self
    }

    /// Returns the primary input key, if any.
    #[must_use]
    pub fn primary_input(&self) -> Option<&str> {
        self.inputs.first().map(String::as_str)
    }
}

/// Rate limiting, circuit breaking, and backoff parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Admitted requests per minute per model.
    pub requests_per_minute: f64,
    /// Token bucket capacity per model.
    pub bucket_capacity: f64,
    /// Maximum simultaneously in-flight calls across all models.
    pub max_parallel_requests: usize,
    /// Jitter fraction added to rate-limit waits (0.0–1.0).
    pub jitter_factor: f64,
    /// Consecutive failures before a circuit opens.
    pub failure_threshold: u32,
    /// Initial breaker cooldown in seconds.
    pub cooldown_seconds: f64,
    /// Cooldown growth factor on re-open from half-open.
    pub cooldown_growth: f64,
    /// Transient retries per candidate within one dispatch.
    pub max_transient_retries: u32,
    /// Initial transient backoff in seconds.
    pub initial_backoff_seconds: f64,
    /// Cap on backoff and breaker cooldown in seconds.
    pub max_backoff_seconds: f64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_minute: 20.0,
            bucket_capacity: 20.0,
            max_parallel_requests: 3,
            jitter_factor: 0.2,
            failure_threshold: 5,
            cooldown_seconds: 30.0,
            cooldown_growth: 2.0,
            max_transient_retries: 3,
            initial_backoff_seconds: 2.0,
            max_backoff_seconds: 60.0,
        }
    }
}

impl RateLimitSettings {
    /// Token refill rate in tokens per second.
    #[must_use]
    pub fn refill_rate(&self) -> f64 {
        self.requests_per_minute / 60.0
    }
}

/// How context is assembled for a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStrategy {
    /// Embedding-based retrieval of the most relevant chunks.
    #[default]
    SmartSelection,
    /// The entire stored corpus, subject to window limits.
    Full,
    /// External summarizer collaborator.
    Summary,
}

/// Memory, retrieval, and cache parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySettings {
    /// Chunk size in tokens.
    pub chunk_size: usize,
    /// Overlap between consecutive chunks in tokens.
    pub overlap: usize,
    /// Minimum cosine similarity for retrieval.
    pub similarity_threshold: f32,
    /// Maximum chunks returned by retrieval.
    pub max_chunks: usize,
    /// Response cache TTL in seconds.
    pub ttl_seconds: f64,
    /// Chunk TTL in seconds.
    pub chunk_ttl_seconds: f64,
    /// Context assembly strategy.
    pub context_strategy: ContextStrategy,
    /// Context window sizes (tokens) per model id.
    #[serde(default)]
    pub model_windows: HashMap<String, usize>,
    /// Window for models missing from `model_windows`.
    pub default_window: usize,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            overlap: 100,
            similarity_threshold: 0.5,
            max_chunks: 6,
            ttl_seconds: 3600.0,
            chunk_ttl_seconds: 86_400.0,
            context_strategy: ContextStrategy::SmartSelection,
            model_windows: HashMap::new(),
            default_window: 8000,
        }
    }
}

impl MemorySettings {
    /// Returns the context window for a model id.
    #[must_use]
    pub fn window_for(&self, model: &str) -> usize {
        self.model_windows
            .get(model)
            .copied()
            .unwrap_or(self.default_window)
    }
}

/// Complete engine configuration for a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Stage definitions in declaration order.
    pub stages: Vec<StageDefinition>,
    /// Rate limiting parameters.
    #[serde(default)]
    pub rate: RateLimitSettings,
    /// Memory parameters.
    #[serde(default)]
    pub memory: MemorySettings,
}

impl EngineConfig {
    /// Creates a configuration from stage definitions with default settings.
    #[must_use]
    pub fn new(stages: Vec<StageDefinition>) -> Self {
        Self {
            stages,
            rate: RateLimitSettings::default(),
            memory: MemorySettings::default(),
        }
    }

    /// Sets the rate limiting parameters.
    #[must_use]
    pub fn with_rate(mut self, rate: RateLimitSettings) -> Self {
        self.rate = rate;
        self
    }

    /// Sets the memory parameters.
    #[must_use]
    pub fn with_memory(mut self, memory: MemorySettings) -> Self {
        self.memory = memory;
        self
    }

    /// Validates the configuration against the role registry and the keys
    /// seeded at run start.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] describing the first problem found. Called
    /// by the orchestrator before any dispatch.
    pub fn validate(&self, roles: &RoleRegistry, seed_keys: &[&str]) -> Result<(), ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::new("workflow defines no stages"));
        }

        if self.rate.requests_per_minute <= 0.0 {
            return Err(ConfigError::new("requests_per_minute must be positive"));
        }
        if self.rate.max_parallel_requests == 0 {
            return Err(ConfigError::new("max_parallel_requests must be at least 1"));
        }
        if self.memory.overlap >= self.memory.chunk_size {
            return Err(ConfigError::new(format!(
                "chunk overlap ({}) must be smaller than chunk size ({})",
                self.memory.overlap, self.memory.chunk_size
            )));
        }

        let mut seen_ids = HashSet::new();
        let mut available: HashSet<&str> = seed_keys.iter().copied().collect();
        let mut outputs = HashSet::new();

        for stage in &self.stages {
            if !seen_ids.insert(stage.id.as_str()) {
                return Err(ConfigError::new(format!("duplicate stage id '{}'", stage.id))
                    .with_stages(vec![stage.id.clone()]));
            }
            if stage.output.trim().is_empty() {
                return Err(ConfigError::new(format!(
                    "stage '{}' declares no output key",
                    stage.id
                ))
                .with_stages(vec![stage.id.clone()]));
            }
            if !outputs.insert(stage.output.as_str()) {
                return Err(ConfigError::new(format!(
                    "output key '{}' is produced by more than one stage",
                    stage.output
                ))
                .with_stages(vec![stage.id.clone()]));
            }

            for input in &stage.inputs {
                if !available.contains(input.as_str()) {
                    return Err(ConfigError::new(format!(
                        "stage '{}' consumes key '{input}' which no earlier stage produces",
                        stage.id
                    ))
                    .with_stages(vec![stage.id.clone()]));
                }
            }

            match stage.kind {
                StageKind::Standard => {
                    if roles.get(&stage.role).is_none() {
                        return Err(ConfigError::new(format!(
                            "stage '{}' references unknown role '{}'",
                            stage.id, stage.role
                        ))
                        .with_stages(vec![stage.id.clone()]));
                    }
                    if stage.models.is_empty()
                        && roles
                            .get(&stage.role)
                            .is_some_and(|r| r.model_preferences.is_empty())
                    {
                        return Err(ConfigError::new(format!(
                            "stage '{}' has no candidate models",
                            stage.id
                        ))
                        .with_stages(vec![stage.id.clone()]));
                    }
                }
                StageKind::Collaborative => {
                    if stage.participants.is_empty() {
                        return Err(ConfigError::new(format!(
                            "collaborative stage '{}' has no participants",
                            stage.id
                        ))
                        .with_stages(vec![stage.id.clone()]));
                    }
                    for participant in &stage.participants {
                        let Some(role) = roles.get(&participant.role) else {
                            return Err(ConfigError::new(format!(
                                "stage '{}' participant references unknown role '{}'",
                                stage.id, participant.role
                            ))
                            .with_stages(vec![stage.id.clone()]));
                        };
                        if participant.primary_model.is_none() && role.model_preferences.is_empty()
                        {
                            return Err(ConfigError::new(format!(
                                "stage '{}' participant '{}' has no candidate models",
                                stage.id, participant.role
                            ))
                            .with_stages(vec![stage.id.clone()]));
                        }
                    }
                }
            }

            if let Some(validation) = &stage.validation {
                if let Some(key) = &validation.consistency_with {
                    if !available.contains(key.as_str()) {
                        return Err(ConfigError::new(format!(
                            "stage '{}' checks consistency against key '{key}' which no earlier stage produces",
                            stage.id
                        ))
                        .with_stages(vec![stage.id.clone()]));
                    }
                }
            }

            available.insert(stage.output.as_str());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::RoleSpec;

    fn registry() -> RoleRegistry {
        let registry = RoleRegistry::new();
        registry.register(
            RoleSpec::new("engineer", "You are an engineer.")
                .with_model_preferences(["m/primary", "m/backup"]),
        );
        registry
    }

    fn stage(id: &str, input: &str, output: &str) -> StageDefinition {
        StageDefinition::new(id, format!("Do {id}"), "engineer")
            .with_inputs([input])
            .with_output(output)
            .with_models(["m/primary"])
    }

    #[test]
    fn test_valid_chain() {
        let config = EngineConfig::new(vec![
            stage("requirements", "idea", "requirements_doc"),
            stage("design", "requirements_doc", "design_doc"),
        ]);

        assert!(config.validate(&registry(), &["idea"]).is_ok());
    }

    #[test]
    fn test_dangling_input_rejected() {
        let config = EngineConfig::new(vec![stage("design", "missing_key", "design_doc")]);

        let err = config.validate(&registry(), &["idea"]).unwrap_err();
        assert!(err.message.contains("missing_key"));
    }

    #[test]
    fn test_duplicate_output_rejected() {
        let config = EngineConfig::new(vec![
            stage("a", "idea", "doc"),
            stage("b", "idea", "doc"),
        ]);

        let err = config.validate(&registry(), &["idea"]).unwrap_err();
        assert!(err.message.contains("doc"));
    }

    #[test]
    fn test_unknown_role_rejected() {
        let mut bad = stage("a", "idea", "doc");
        bad.role = "nobody".to_string();
        let config = EngineConfig::new(vec![bad]);

        let err = config.validate(&registry(), &["idea"]).unwrap_err();
        assert!(err.message.contains("nobody"));
    }

    #[test]
    fn test_overlap_must_be_smaller_than_chunk_size() {
        let mut config = EngineConfig::new(vec![stage("a", "idea", "doc")]);
        config.memory.chunk_size = 100;
        config.memory.overlap = 100;

        assert!(config.validate(&registry(), &["idea"]).is_err());
    }

    #[test]
    fn test_collaborative_requires_participants() {
        let mut def = stage("review", "idea", "review_doc");
        def.kind = StageKind::Collaborative;
        def.models.clear();
        let config = EngineConfig::new(vec![def]);

        assert!(config.validate(&registry(), &["idea"]).is_err());
    }

    #[test]
    fn test_refill_rate_derivation() {
        let rate = RateLimitSettings {
            requests_per_minute: 30.0,
            ..Default::default()
        };
        assert!((rate.refill_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_window_lookup_falls_back_to_default() {
        let mut memory = MemorySettings::default();
        memory.model_windows.insert("m/large".to_string(), 128_000);

        assert_eq!(memory.window_for("m/large"), 128_000);
        assert_eq!(memory.window_for("m/unknown"), memory.default_window);
    }
}

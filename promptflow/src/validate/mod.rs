//! Output validation.
//!
//! Checks run in order — structural (sections, then patterns), schema,
//! consistency — and the first failure wins. The orchestrator drives the
//! bounded feedback-retry loop; this module only judges output.

use crate::config::{SchemaSpec, ValidationSpec};
use crate::errors::{ValidationCheck, ValidationFailure};
use crate::memory::{cosine_similarity, Embedder};
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

/// Validates stage outputs against a [`ValidationSpec`].
#[derive(Debug)]
pub struct ValidationGate {
    embedder: Arc<dyn Embedder>,
}

impl ValidationGate {
    /// Creates a gate using the given embedder for consistency checks.
    #[must_use]
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }

    /// Validates `output` against `spec`.
    ///
    /// `prior` is the content named by `spec.consistency_with`, resolved by
    /// the caller; it is only read when the consistency check is enabled.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationFailure`], with the failing check and
    /// what was missing.
    pub async fn validate(
        &self,
        output: &str,
        spec: &ValidationSpec,
        prior: Option<&str>,
    ) -> Result<(), ValidationFailure> {
        check_sections(output, &spec.required_sections)?;
        check_patterns(output, &spec.required_patterns)?;

        if let Some(schema) = &spec.schema {
            check_schema(output, schema)?;
        }

        if spec.consistency_with.is_some() {
            let prior = prior.unwrap_or("");
            self.check_consistency(output, prior, spec.consistency_threshold)
                .await?;
        }

        Ok(())
    }

    /// Embedding-similarity consistency check against a prior output.
    async fn check_consistency(
        &self,
        output: &str,
        prior: &str,
        threshold: f32,
    ) -> Result<(), ValidationFailure> {
        let output_embedding = self.embedder.embed(output).await.map_err(|e| {
            ValidationFailure::new(ValidationCheck::Consistency, e.to_string())
        })?;
        let prior_embedding = self.embedder.embed(prior).await.map_err(|e| {
            ValidationFailure::new(ValidationCheck::Consistency, e.to_string())
        })?;

        let similarity = cosine_similarity(&output_embedding, &prior_embedding);
        debug!(similarity, threshold, "Consistency check");

        if similarity < threshold {
            return Err(ValidationFailure::new(
                ValidationCheck::Consistency,
                format!(
                    "output similarity {similarity:.2} to the prior stage is below the required {threshold:.2}"
                ),
            ));
        }
        Ok(())
    }
}

/// Checks that every required section header is present.
///
/// A section counts as present under any of the common shapes the upstream
/// models produce: markdown headers, `Name:`, an underlined title, bold, or
/// a numbered heading.
fn check_sections(output: &str, sections: &[String]) -> Result<(), ValidationFailure> {
    let mut missing = Vec::new();

    for section in sections {
        let escaped = regex::escape(section);
        let patterns = [
            format!(r"(?mi)^#+\s*{escaped}[\s:]*$"),
            format!(r"(?mi)^{escaped}\s*:"),
            format!(r"(?mi)^{escaped}\s*\n[=\-]+\s*$"),
            format!(r"(?mi)^\*\*{escaped}\*\*"),
            format!(r"(?mi)^\d+[.)]\s*{escaped}\b"),
        ];

        let found = patterns
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .any(|re| re.is_match(output));

        if !found {
            missing.push(section.clone());
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ValidationFailure::new(
            ValidationCheck::Sections,
            format!("missing required sections: {}", missing.join(", ")),
        ))
    }
}

/// Checks that every required pattern occurs (case-insensitively).
fn check_patterns(output: &str, patterns: &[String]) -> Result<(), ValidationFailure> {
    let lowered = output.to_lowercase();
    let missing: Vec<String> = patterns
        .iter()
        .filter(|p| !lowered.contains(&p.to_lowercase()))
        .cloned()
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ValidationFailure::new(
            ValidationCheck::Patterns,
            format!("missing required patterns: {}", missing.join(", ")),
        ))
    }
}

/// Extracts a JSON payload and requires the schema's top-level properties.
fn check_schema(output: &str, schema: &SchemaSpec) -> Result<(), ValidationFailure> {
    let Some(payload) = extract_json(output) else {
        return Err(ValidationFailure::new(
            ValidationCheck::Schema,
            format!("no JSON payload found for schema '{}'", schema.name),
        ));
    };

    let Some(object) = payload.as_object() else {
        return Err(ValidationFailure::new(
            ValidationCheck::Schema,
            format!("JSON payload for schema '{}' is not an object", schema.name),
        ));
    };

    let missing: Vec<String> = schema
        .required
        .iter()
        .filter(|key| !object.contains_key(*key))
        .cloned()
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ValidationFailure::new(
            ValidationCheck::Schema,
            format!(
                "schema '{}' missing required properties: {}",
                schema.name,
                missing.join(", ")
            ),
        ))
    }
}

/// Pulls a JSON value out of a fenced ```json block, or the first balanced
/// top-level object in the text.
fn extract_json(output: &str) -> Option<serde_json::Value> {
    if let Ok(re) = Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```") {
        if let Some(captures) = re.captures(output) {
            if let Some(body) = captures.get(1) {
                if let Ok(value) = serde_json::from_str(body.as_str()) {
                    return Some(value);
                }
            }
        }
    }

    let start = output.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in output[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &output[start..=start + offset];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::HashEmbedder;

    fn gate() -> ValidationGate {
        ValidationGate::new(Arc::new(HashEmbedder::new()))
    }

    fn spec_with_sections(sections: &[&str]) -> ValidationSpec {
        ValidationSpec::new().with_sections(sections.iter().copied())
    }

    #[tokio::test]
    async fn test_markdown_sections_accepted() {
        let output = "# Overview\ncontent\n\n## Components\nmore content\n";
        let spec = spec_with_sections(&["Overview", "Components"]);

        assert!(gate().validate(output, &spec, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_alternate_header_shapes_accepted() {
        let output = "Overview:\ntext\n\n**Components**\ntext\n\n1. Timeline\ntext\n";
        let spec = spec_with_sections(&["Overview", "Components", "Timeline"]);

        assert!(gate().validate(output, &spec, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_section_names_it() {
        let output = "# Overview\ncontent\n";
        let spec = spec_with_sections(&["Overview", "Risks"]);

        let err = gate().validate(output, &spec, None).await.unwrap_err();

        assert_eq!(err.check, ValidationCheck::Sections);
        assert!(err.detail.contains("Risks"));
        assert!(!err.detail.contains("Overview,"));
    }

    #[tokio::test]
    async fn test_patterns_case_insensitive() {
        let output = "The API uses JWT Authentication throughout.";
        let spec = ValidationSpec::new().with_patterns(["jwt authentication"]);

        assert!(gate().validate(output, &spec, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_pattern_fails() {
        let output = "Nothing relevant here.";
        let spec = ValidationSpec::new().with_patterns(["def ", "class "]);

        let err = gate().validate(output, &spec, None).await.unwrap_err();
        assert_eq!(err.check, ValidationCheck::Patterns);
    }

    #[tokio::test]
    async fn test_schema_from_fenced_block() {
        let output = "Result:\n```json\n{\"tasks\": [], \"timeline\": []}\n```\n";
        let spec = ValidationSpec::new().with_schema(SchemaSpec::new(
            "plan",
            vec!["tasks".to_string(), "timeline".to_string()],
        ));

        assert!(gate().validate(output, &spec, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_schema_missing_property() {
        let output = "{\"tasks\": []}";
        let spec = ValidationSpec::new().with_schema(SchemaSpec::new(
            "plan",
            vec!["tasks".to_string(), "timeline".to_string()],
        ));

        let err = gate().validate(output, &spec, None).await.unwrap_err();

        assert_eq!(err.check, ValidationCheck::Schema);
        assert!(err.detail.contains("timeline"));
    }

    #[tokio::test]
    async fn test_schema_no_json_at_all() {
        let output = "plain prose, no json";
        let spec = ValidationSpec::new().with_schema(SchemaSpec::new("plan", vec![]));

        let err = gate().validate(output, &spec, None).await.unwrap_err();
        assert_eq!(err.check, ValidationCheck::Schema);
    }

    #[tokio::test]
    async fn test_consistency_passes_for_overlapping_content() {
        let prior = "login api with jwt authentication and session tokens";
        let output = "login api with jwt authentication and session tokens plus detail";
        let spec = ValidationSpec::new().with_consistency("requirements_doc", 0.5);

        assert!(gate().validate(output, &spec, Some(prior)).await.is_ok());
    }

    #[tokio::test]
    async fn test_consistency_fails_for_unrelated_content() {
        let prior = "login api with jwt authentication and session tokens";
        let output = "recipe for sourdough bread with rye flour";
        let spec = ValidationSpec::new().with_consistency("requirements_doc", 0.5);

        let err = gate()
            .validate(output, &spec, Some(prior))
            .await
            .unwrap_err();
        assert_eq!(err.check, ValidationCheck::Consistency);
    }

    #[tokio::test]
    async fn test_check_order_sections_first() {
        let output = "no structure at all";
        let spec = ValidationSpec::new()
            .with_sections(["Overview"])
            .with_patterns(["also missing"])
            .with_schema(SchemaSpec::new("s", vec![]));

        let err = gate().validate(output, &spec, None).await.unwrap_err();
        assert_eq!(err.check, ValidationCheck::Sections);
    }

    #[test]
    fn test_extract_json_bare_object() {
        let value = extract_json("prefix {\"a\": {\"nested\": 1}} suffix").unwrap();
        assert_eq!(value["a"]["nested"], 1);
    }

    #[test]
    fn test_extract_json_handles_braces_in_strings() {
        let value = extract_json("{\"text\": \"curly } brace\"}").unwrap();
        assert_eq!(value["text"], "curly } brace");
    }
}

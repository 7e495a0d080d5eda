//! End-to-end orchestration tests over deterministic mocks.

use crate::config::{
    EngineConfig, ParticipantSpec, RateLimitSettings, StageDefinition, ValidationSpec,
};
use crate::dispatch::ModelDispatcher;
use crate::errors::EngineError;
use crate::events::CollectingEventSink;
use crate::limiter::{BackoffPolicy, CircuitBreaker, RateLimiter};
use crate::memory::MemoryManager;
use crate::pipeline::run::{CancelToken, RunStatus, StageStatus};
use crate::pipeline::PipelineOrchestrator;
use crate::roles::{RoleRegistry, RoleSpec};
use crate::testing::mocks::{HashEmbedder, ManualClock, ScriptedProvider};
use crate::validate::ValidationGate;
use pretty_assertions::assert_eq;
use std::sync::Arc;

struct Harness {
    clock: Arc<ManualClock>,
    provider: Arc<ScriptedProvider>,
    orchestrator: PipelineOrchestrator,
}

fn harness(config: EngineConfig, roles: RoleRegistry) -> Harness {
    let clock = Arc::new(ManualClock::new());
    let provider = Arc::new(ScriptedProvider::new());
    provider.attach_clock(clock.clone());

    let limiter = Arc::new(RateLimiter::new(&config.rate, clock.clone()));
    let breaker = Arc::new(CircuitBreaker::new(&config.rate, clock.clone()));
    let backoff = BackoffPolicy::new(
        config.rate.initial_backoff_seconds,
        config.rate.max_backoff_seconds,
        config.rate.max_transient_retries,
    )
    .with_jitter(0.0);
    let dispatcher = Arc::new(ModelDispatcher::new(
        provider.clone(),
        limiter,
        breaker,
        backoff,
        clock.clone(),
    ));

    let embedder = Arc::new(HashEmbedder::new());
    let memory = Arc::new(MemoryManager::new(
        config.memory.clone(),
        embedder.clone(),
        clock.clone(),
    ));
    let gate = Arc::new(ValidationGate::new(embedder));

    let orchestrator = PipelineOrchestrator::new(
        config,
        Arc::new(roles),
        dispatcher,
        memory,
        gate,
        clock.clone(),
    );

    Harness {
        clock,
        provider,
        orchestrator,
    }
}

fn role(id: &str, models: &[&str]) -> RoleSpec {
    RoleSpec::new(id, format!("You are the {id}."))
        .with_model_preferences(models.iter().copied())
}

fn quiet_rate() -> RateLimitSettings {
    RateLimitSettings {
        requests_per_minute: 600.0,
        bucket_capacity: 100.0,
        jitter_factor: 0.0,
        ..Default::default()
    }
}

#[tokio::test]
async fn scenario_a_sequential_stages_pass_output_verbatim() {
    let roles = RoleRegistry::new();
    roles.register(role("analyst", &["m/1"]));
    roles.register(role("architect", &["m/2"]));

    let config = EngineConfig::new(vec![
        StageDefinition::new("requirements", "Write the requirements.", "analyst")
            .with_inputs(["idea"])
            .with_output("requirements_doc")
            .with_models(["m/1"]),
        StageDefinition::new("design", "Write the design.", "architect")
            .with_inputs(["requirements_doc"])
            .with_output("design_doc")
            .with_models(["m/2"]),
    ])
    .with_rate(quiet_rate());

    let h = harness(config, roles);
    h.provider.succeed_with("m/1", "REQ-1: users can log in.");
    h.provider.succeed_with("m/2", "Design: token service plus session store.");

    let result = h.orchestrator.run("idea", "build a login api").await.unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(
        result.outputs.get("requirements_doc").unwrap(),
        "REQ-1: users can log in."
    );
    assert_eq!(
        result.outputs.get("design_doc").unwrap(),
        "Design: token service plus session store."
    );

    // Stage 2 observed stage 1's accepted output verbatim.
    let design_calls: Vec<_> = h
        .provider
        .calls()
        .into_iter()
        .filter(|c| c.model == "m/2")
        .collect();
    assert_eq!(design_calls.len(), 1);
    assert!(design_calls[0]
        .user_prompt
        .contains("REQ-1: users can log in."));
}

#[tokio::test]
async fn scenario_b_failover_to_backup_model() {
    use crate::errors::ProviderErrorKind;

    let roles = RoleRegistry::new();
    roles.register(role("analyst", &["m/primary", "m/backup"]));

    let mut rate = quiet_rate();
    rate.max_transient_retries = 1;
    rate.failure_threshold = 10;

    let config = EngineConfig::new(vec![StageDefinition::new(
        "requirements",
        "Write the requirements.",
        "analyst",
    )
    .with_inputs(["idea"])
    .with_output("requirements_doc")
    .with_models(["m/primary", "m/backup"])])
    .with_rate(rate);

    let h = harness(config, roles);
    h.provider.fail_with("m/primary", ProviderErrorKind::ServerError);
    h.provider.succeed_with("m/backup", "requirements from the backup model");

    let result = h.orchestrator.run("idea", "build a login api").await.unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(
        result.outputs.get("requirements_doc").unwrap(),
        "requirements from the backup model"
    );
    assert_eq!(
        result.stage("requirements").unwrap().model.as_deref(),
        Some("m/backup")
    );
    assert!(h.provider.calls_for("m/primary") >= 1);
}

#[tokio::test]
async fn scenario_c_rate_limited_calls_are_spaced() {
    let roles = RoleRegistry::new();
    roles.register(role("writer", &["m/c"]));

    let rate = RateLimitSettings {
        requests_per_minute: 2.0,
        bucket_capacity: 1.0,
        jitter_factor: 0.0,
        ..Default::default()
    };

    let stages: Vec<StageDefinition> = (0..5)
        .map(|i| {
            let input = if i == 0 {
                "idea".to_string()
            } else {
                format!("doc_{}", i - 1)
            };
            StageDefinition::new(format!("stage_{i}"), format!("Write part {i}."), "writer")
                .with_inputs([input])
                .with_output(format!("doc_{i}"))
                .with_models(["m/c"])
        })
        .collect();

    let config = EngineConfig::new(stages).with_rate(rate);

    let h = harness(config, roles);
    h.provider.succeed_with("m/c", "content");

    let result = h.orchestrator.run("idea", "seed").await.unwrap();
    assert_eq!(result.status, RunStatus::Succeeded);

    let calls = h.provider.calls();
    assert_eq!(calls.len(), 5);
    // requests_per_minute = 2 refills one token per 30s.
    for pair in calls.windows(2) {
        assert!(
            pair[1].at - pair[0].at >= 30.0 - 1e-6,
            "calls spaced {}s apart",
            pair[1].at - pair[0].at
        );
    }
}

#[tokio::test]
async fn scenario_d_collaborative_partial_failure() {
    let roles = RoleRegistry::new();
    roles.register(role("optimist", &["m/r1"]));
    roles.register(role("skeptic", &["m/r2"]));
    roles.register(role("pragmatist", &["m/r3"]));

    let config = EngineConfig::new(vec![StageDefinition::new(
        "team_review",
        "Review the proposal.",
        "optimist",
    )
    .with_inputs(["idea"])
    .with_output("review_doc")
    .with_validation(ValidationSpec::new().with_sections(["Summary"]))
    .with_max_retries(1)
    .collaborative(vec![
        ParticipantSpec::new("optimist"),
        ParticipantSpec::new("skeptic"),
        ParticipantSpec::new("pragmatist"),
    ])])
    .with_rate(quiet_rate());

    let h = harness(config, roles);
    h.provider.succeed_with("m/r1", "# Summary\nlooks promising");
    h.provider.succeed_with("m/r2", "rambling text without any structure");
    h.provider.succeed_with("m/r3", "# Summary\nworkable with caveats");

    let result = h.orchestrator.run("idea", "proposal text").await.unwrap();

    assert_eq!(result.status, RunStatus::PartiallyFailed);

    // Surviving participants' outputs are kept, keyed by role.
    let merged = result.outputs.get("review_doc").unwrap();
    assert!(merged.contains("## optimist"));
    assert!(merged.contains("looks promising"));
    assert!(merged.contains("## pragmatist"));
    assert!(merged.contains("workable with caveats"));
    assert!(!merged.contains("## skeptic"));

    // The failed participant's reason is recorded verbatim.
    let record = result.stage("team_review").unwrap();
    assert_eq!(record.status, StageStatus::Failed);
    let error = record.error.as_deref().unwrap();
    assert!(error.contains("participant 'skeptic'"));
    assert!(error.contains("Summary"));

    // Initial attempt plus one feedback retry for the failing participant.
    assert_eq!(h.provider.calls_for("m/r2"), 2);
}

#[tokio::test]
async fn validation_retry_with_feedback_then_success() {
    let roles = RoleRegistry::new();
    roles.register(role("planner", &["m/v"]));

    let config = EngineConfig::new(vec![StageDefinition::new(
        "plan",
        "Write the plan.",
        "planner",
    )
    .with_inputs(["idea"])
    .with_output("plan_doc")
    .with_models(["m/v"])
    .with_validation(ValidationSpec::new().with_sections(["Summary"]))
    .with_max_retries(1)])
    .with_rate(quiet_rate());

    let h = harness(config, roles);
    h.provider.push_response("m/v", Ok("unstructured first attempt".to_string()));
    h.provider.succeed_with("m/v", "# Summary\nthe corrected plan");

    let result = h.orchestrator.run("idea", "seed").await.unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.outputs.get("plan_doc").unwrap(), "# Summary\nthe corrected plan");

    let record = result.stage("plan").unwrap();
    assert_eq!(record.attempts, 2);

    // The retry prompt carried the validation feedback.
    let calls = h.provider.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].user_prompt.contains("failed validation"));
    assert!(calls[1].user_prompt.contains("Summary"));
}

#[tokio::test]
async fn validation_exhaustion_fails_stage_and_skips_dependents() {
    let roles = RoleRegistry::new();
    roles.register(role("planner", &["m/v"]));
    roles.register(role("coder", &["m/code"]));

    let config = EngineConfig::new(vec![
        StageDefinition::new("plan", "Write the plan.", "planner")
            .with_inputs(["idea"])
            .with_output("plan_doc")
            .with_models(["m/v"])
            .with_validation(ValidationSpec::new().with_sections(["Summary"]))
            .with_max_retries(2),
        StageDefinition::new("code", "Write the code.", "coder")
            .with_inputs(["plan_doc"])
            .with_output("code_doc")
            .with_models(["m/code"]),
    ])
    .with_rate(quiet_rate());

    let h = harness(config, roles);
    h.provider.succeed_with("m/v", "never has the required section");
    h.provider.succeed_with("m/code", "unused");

    let result = h.orchestrator.run("idea", "seed").await.unwrap();

    assert_eq!(result.status, RunStatus::PartiallyFailed);

    let plan = result.stage("plan").unwrap();
    assert_eq!(plan.status, StageStatus::Failed);
    assert_eq!(plan.attempts, 3);
    assert!(plan.error.as_deref().unwrap().contains("Summary"));

    // The dependent stage was never dispatched.
    let code = result.stage("code").unwrap();
    assert_eq!(code.status, StageStatus::Skipped);
    assert!(code.error.as_deref().unwrap().contains("'plan' failed"));
    assert_eq!(h.provider.calls_for("m/code"), 0);
    assert!(!result.outputs.contains_key("code_doc"));
}

#[tokio::test]
async fn cache_collapses_identical_requests_across_runs() {
    let roles = RoleRegistry::new();
    roles.register(role("writer", &["m/cache"]));

    let seed = "build a login api with jwt";
    let mut config = EngineConfig::new(vec![StageDefinition::new(
        "draft",
        seed,
        "writer",
    )
    .with_inputs(["idea"])
    .with_output("draft_doc")
    .with_models(["m/cache"])])
    .with_rate(quiet_rate());
    config.memory.similarity_threshold = 0.9;
    config.memory.max_chunks = 1;

    let h = harness(config, roles);
    h.provider.succeed_with("m/cache", "zebra giraffe unrelated words");

    let first = h.orchestrator.run("idea", seed).await.unwrap();
    let second = h.orchestrator.run("idea", seed).await.unwrap();

    assert_eq!(first.status, RunStatus::Succeeded);
    assert_eq!(second.status, RunStatus::Succeeded);
    assert_eq!(
        first.outputs.get("draft_doc"),
        second.outputs.get("draft_doc")
    );
    assert_eq!(
        h.provider.calls_for("m/cache"),
        1,
        "second run must be served from cache"
    );
}

#[tokio::test]
async fn cancelled_run_skips_everything() {
    let roles = RoleRegistry::new();
    roles.register(role("writer", &["m/1"]));

    let config = EngineConfig::new(vec![StageDefinition::new(
        "draft",
        "Write the draft.",
        "writer",
    )
    .with_inputs(["idea"])
    .with_output("draft_doc")
    .with_models(["m/1"])])
    .with_rate(quiet_rate());

    let h = harness(config, roles);
    h.provider.succeed_with("m/1", "unused");

    let cancel = CancelToken::new();
    cancel.cancel("operator abort");

    let result = h
        .orchestrator
        .run_with_cancel("idea", "seed", cancel)
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Cancelled);
    let record = result.stage("draft").unwrap();
    assert_eq!(record.status, StageStatus::Skipped);
    assert!(record.error.as_deref().unwrap().contains("operator abort"));
    assert_eq!(h.provider.total_calls(), 0);
}

#[tokio::test]
async fn malformed_config_fails_before_any_dispatch() {
    let roles = RoleRegistry::new();
    roles.register(role("writer", &["m/1"]));

    let config = EngineConfig::new(vec![StageDefinition::new(
        "draft",
        "Write the draft.",
        "writer",
    )
    .with_inputs(["no_such_key"])
    .with_output("draft_doc")
    .with_models(["m/1"])]);

    let h = harness(config, roles);
    h.provider.succeed_with("m/1", "unused");

    let err = h.orchestrator.run("idea", "seed").await.unwrap_err();

    assert!(matches!(err, EngineError::Config(_)));
    assert_eq!(h.provider.total_calls(), 0);
}

#[tokio::test]
async fn independent_stages_run_and_events_are_emitted() {
    let roles = RoleRegistry::new();
    roles.register(role("writer", &["m/1"]));
    roles.register(role("reviewer", &["m/2"]));

    let config = EngineConfig::new(vec![
        StageDefinition::new("draft", "Write the draft.", "writer")
            .with_inputs(["idea"])
            .with_output("draft_doc")
            .with_models(["m/1"]),
        StageDefinition::new("notes", "Write reviewer notes.", "reviewer")
            .with_inputs(["idea"])
            .with_output("notes_doc")
            .with_models(["m/2"]),
    ])
    .with_rate(quiet_rate());

    let events = Arc::new(CollectingEventSink::new());
    let mut h = harness(config, roles);
    h.orchestrator = h.orchestrator.with_events(events.clone());
    h.provider.succeed_with("m/1", "draft text");
    h.provider.succeed_with("m/2", "notes text");

    let result = h.orchestrator.run("idea", "seed").await.unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.outputs.get("draft_doc").unwrap(), "draft text");
    assert_eq!(result.outputs.get("notes_doc").unwrap(), "notes text");

    assert_eq!(events.events_of_type("stage.started").len(), 2);
    assert_eq!(events.events_of_type("stage.completed").len(), 2);
    assert_eq!(events.events_of_type("run.completed").len(), 1);
}

#[tokio::test]
async fn permanent_provider_error_fails_stage_without_failover() {
    use crate::errors::ProviderErrorKind;

    let roles = RoleRegistry::new();
    roles.register(role("writer", &["m/auth", "m/backup"]));

    let config = EngineConfig::new(vec![StageDefinition::new(
        "draft",
        "Write the draft.",
        "writer",
    )
    .with_inputs(["idea"])
    .with_output("draft_doc")
    .with_models(["m/auth", "m/backup"])])
    .with_rate(quiet_rate());

    let h = harness(config, roles);
    h.provider.fail_with("m/auth", ProviderErrorKind::AuthError);
    h.provider.succeed_with("m/backup", "unused");

    let result = h.orchestrator.run("idea", "seed").await.unwrap();

    assert_eq!(result.status, RunStatus::PartiallyFailed);
    let record = result.stage("draft").unwrap();
    assert_eq!(record.status, StageStatus::Failed);
    assert!(record.error.as_deref().unwrap().contains("auth_error"));
    assert_eq!(h.provider.calls_for("m/backup"), 0);
    assert!(h.clock.sleeps().is_empty(), "no backoff for permanent errors");
}

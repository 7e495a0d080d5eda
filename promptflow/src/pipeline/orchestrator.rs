//! Pipeline orchestration.
//!
//! Executes stages as soon as the producers of their input keys have
//! succeeded. Sequential chains therefore always observe fully-validated
//! predecessor output; independent stages and collaborative participants run
//! concurrently, bounded by the global in-flight cap. A failed stage never
//! aborts the run: its dependents are skipped without dispatching and every
//! failure reason is preserved verbatim in the stage log.

use crate::clock::Clock;
use crate::config::{EngineConfig, StageDefinition, StageKind};
use crate::dispatch::{Completion, DispatchRequest, ModelDispatcher};
use crate::errors::{EngineError, StageError};
use crate::events::{EventSink, NoOpEventSink};
use crate::memory::{fingerprint, MemoryManager};
use crate::pipeline::run::{
    CancelToken, PipelineRun, RunResult, RunStatus, StageRecord, StageStatus,
};
use crate::roles::RoleRegistry;
use crate::validate::ValidationGate;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one stage task.
struct StageOutcome {
    index: usize,
    output: Option<String>,
    succeeded: bool,
}

/// Drives a configured pipeline to completion.
pub struct PipelineOrchestrator {
    config: EngineConfig,
    roles: Arc<RoleRegistry>,
    dispatcher: Arc<ModelDispatcher>,
    memory: Arc<MemoryManager>,
    gate: Arc<ValidationGate>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("stages", &self.config.stages.len())
            .finish()
    }
}

impl PipelineOrchestrator {
    /// Creates an orchestrator over the shared engine components.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        roles: Arc<RoleRegistry>,
        dispatcher: Arc<ModelDispatcher>,
        memory: Arc<MemoryManager>,
        gate: Arc<ValidationGate>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            roles,
            dispatcher,
            memory,
            gate,
            events: Arc::new(NoOpEventSink),
            clock,
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Runs the pipeline with a fresh cancellation token.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if the configuration is rejected;
    /// individual stage failures are recorded in the result, never raised.
    pub async fn run(&self, seed_key: &str, seed_content: &str) -> Result<RunResult, EngineError> {
        self.run_with_cancel(seed_key, seed_content, CancelToken::new())
            .await
    }

    /// Runs the pipeline with a caller-held cancellation token.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] if the configuration is rejected.
    pub async fn run_with_cancel(
        &self,
        seed_key: &str,
        seed_content: &str,
        cancel: Arc<CancelToken>,
    ) -> Result<RunResult, EngineError> {
        self.config.validate(&self.roles, &[seed_key])?;

        let run = PipelineRun::new(seed_key, seed_content, cancel);
        info!(run_id = %run.id, stages = self.config.stages.len(), "Pipeline run started");

        for def in &self.config.stages {
            run.init_record(&def.id);
        }

        if let Err(e) = self.memory.ingest(seed_key, seed_content).await {
            warn!(error = %e, "Seed document could not be ingested; retrieval degraded");
        }

        // Producer/consumer wiring by context key.
        let stages = &self.config.stages;
        let producer_of: HashMap<&str, usize> = stages
            .iter()
            .enumerate()
            .map(|(i, def)| (def.output.as_str(), i))
            .collect();
        let task_of_key: HashMap<&str, &str> = stages
            .iter()
            .map(|def| (def.output.as_str(), def.task.as_str()))
            .collect();

        let mut remaining_deps = vec![0usize; stages.len()];
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); stages.len()];
        for (i, def) in stages.iter().enumerate() {
            for input in &def.inputs {
                if let Some(&p) = producer_of.get(input.as_str()) {
                    remaining_deps[i] += 1;
                    children[p].push(i);
                }
            }
        }

        let mut launched = vec![false; stages.len()];
        let mut terminal = vec![false; stages.len()];
        let mut active: FuturesUnordered<
            Pin<Box<dyn Future<Output = StageOutcome> + Send + '_>>,
        > = FuturesUnordered::new();

        loop {
            // Launch every ready stage; under cancellation, new dispatches
            // are never started.
            for (i, def) in stages.iter().enumerate() {
                if launched[i] || terminal[i] || remaining_deps[i] > 0 {
                    continue;
                }
                if run.is_cancelled() {
                    let reason = run
                        .cancel_token()
                        .reason()
                        .map_or_else(|| "run cancelled".to_string(), |r| format!("run cancelled: {r}"));
                    terminal[i] = true;
                    self.mark_skipped(&run, def, &reason);
                    continue;
                }

                launched[i] = true;
                let inputs_text = def
                    .inputs
                    .iter()
                    .filter_map(|k| run.output(k))
                    .collect::<Vec<_>>()
                    .join("\n\n");
                let prior = def
                    .validation
                    .as_ref()
                    .and_then(|v| v.consistency_with.as_ref())
                    .and_then(|key| run.output(key));
                let query = def
                    .primary_input()
                    .and_then(|key| task_of_key.get(key).copied())
                    .unwrap_or(def.task.as_str())
                    .to_string();

                let run_ref = &run;
                active.push(Box::pin(async move {
                    let (output, succeeded) =
                        self.run_stage(def, run_ref, inputs_text, prior, query).await;
                    StageOutcome {
                        index: i,
                        output,
                        succeeded,
                    }
                }));
            }

            let Some(outcome) = active.next().await else {
                break;
            };

            let def = &stages[outcome.index];
            terminal[outcome.index] = true;

            if let Some(content) = &outcome.output {
                run.store_output(&def.output, content);
            }

            if outcome.succeeded {
                if let Some(content) = &outcome.output {
                    if let Err(e) = self.memory.ingest(&def.output, content).await {
                        warn!(stage = %def.id, error = %e, "Accepted output could not be ingested");
                    }
                }
                for &child in &children[outcome.index] {
                    remaining_deps[child] = remaining_deps[child].saturating_sub(1);
                }
            } else {
                self.skip_dependents(
                    &run,
                    outcome.index,
                    &children,
                    &launched,
                    &mut terminal,
                );
            }
        }

        // Anything still pending was stranded by cancellation.
        for (i, def) in stages.iter().enumerate() {
            if !terminal[i] {
                let reason = if run.is_cancelled() {
                    "run cancelled"
                } else {
                    "dependency did not complete"
                };
                self.mark_skipped(&run, def, reason);
            }
        }

        let records: Vec<StageRecord> = stages
            .iter()
            .map(|def| {
                run.record(&def.id)
                    .unwrap_or_else(|| StageRecord::pending(&def.id))
            })
            .collect();

        let status = if run.is_cancelled() {
            RunStatus::Cancelled
        } else if records.iter().all(|r| r.status == StageStatus::Succeeded) {
            RunStatus::Succeeded
        } else {
            RunStatus::PartiallyFailed
        };

        self.events.try_emit(
            "run.completed",
            Some(serde_json::json!({
                "run_id": run.id.to_string(),
                "status": status,
            })),
        );
        info!(run_id = %run.id, ?status, "Pipeline run finished");

        Ok(RunResult {
            run_id: run.id,
            status,
            outputs: run.outputs(),
            stages: records,
        })
    }

    /// Marks a stage skipped with a reason.
    fn mark_skipped(&self, run: &PipelineRun, def: &StageDefinition, reason: &str) {
        run.update_record(&def.id, |r| r.error = Some(reason.to_string()));
        run.set_status(&def.id, StageStatus::Skipped);
        self.events.try_emit(
            "stage.skipped",
            Some(serde_json::json!({"stage": def.id, "reason": reason})),
        );
    }

    /// Transitively skips every unlaunched dependent of a failed stage.
    fn skip_dependents(
        &self,
        run: &PipelineRun,
        failed: usize,
        children: &[Vec<usize>],
        launched: &[bool],
        terminal: &mut [bool],
    ) {
        let mut stack = vec![failed];
        while let Some(i) = stack.pop() {
            for &child in &children[i] {
                if launched[child] || terminal[child] {
                    continue;
                }
                terminal[child] = true;
                let reason = format!("dependency '{}' failed", self.config.stages[i].id);
                self.mark_skipped(run, &self.config.stages[child], &reason);
                stack.push(child);
            }
        }
    }

    /// Executes one stage to a terminal status.
    ///
    /// Returns the accepted (or partially merged) output and whether the
    /// stage succeeded.
    async fn run_stage(
        &self,
        def: &StageDefinition,
        run: &PipelineRun,
        inputs_text: String,
        prior: Option<String>,
        query: String,
    ) -> (Option<String>, bool) {
        run.set_status(&def.id, StageStatus::Running);
        self.events.try_emit(
            "stage.started",
            Some(serde_json::json!({"stage": def.id, "kind": def.kind})),
        );

        let result = match def.kind {
            StageKind::Standard => {
                self.run_standard(def, run, &inputs_text, prior.as_deref(), &query)
                    .await
            }
            StageKind::Collaborative => {
                self.run_collaborative(def, run, &inputs_text, prior.as_deref(), &query)
                    .await
            }
        };

        match result {
            Ok(output) => {
                run.set_status(&def.id, StageStatus::Succeeded);
                self.events.try_emit(
                    "stage.completed",
                    Some(serde_json::json!({"stage": def.id})),
                );
                (Some(output), true)
            }
            Err((error, partial)) => {
                run.update_record(&def.id, |r| r.error = Some(error.clone()));
                run.set_status(&def.id, StageStatus::Failed);
                self.events.try_emit(
                    "stage.failed",
                    Some(serde_json::json!({"stage": def.id, "error": error})),
                );
                (partial, false)
            }
        }
    }

    /// Standard stage: one role, one dispatch-and-validate loop.
    async fn run_standard(
        &self,
        def: &StageDefinition,
        run: &PipelineRun,
        inputs_text: &str,
        prior: Option<&str>,
        query: &str,
    ) -> Result<String, (String, Option<String>)> {
        let Some(role) = self.roles.get(&def.role) else {
            return Err((format!("unknown role '{}'", def.role), None));
        };

        let candidates = if def.models.is_empty() {
            role.model_preferences.clone()
        } else {
            def.models.clone()
        };

        let completion = self
            .generate_validated(
                run,
                &def.id,
                &candidates,
                &role.system_prompt,
                role.output_spec.as_deref(),
                def,
                inputs_text,
                prior,
                query,
            )
            .await
            .map_err(|e| (e.to_string(), None))?;

        run.update_record(&def.id, |r| r.model = Some(completion.model.clone()));
        Ok(completion.content)
    }

    /// Collaborative stage: participants run concurrently; outputs merge
    /// keyed by role. Sibling outputs survive a participant failure.
    async fn run_collaborative(
        &self,
        def: &StageDefinition,
        run: &PipelineRun,
        inputs_text: &str,
        prior: Option<&str>,
        query: &str,
    ) -> Result<String, (String, Option<String>)> {
        let participant_tasks = def.participants.iter().map(|participant| {
            let role_id = participant.role.clone();
            async move {
                let Some(role) = self.roles.get(&role_id) else {
                    return (role_id.clone(), Err(format!("unknown role '{role_id}'")));
                };
                let candidates =
                    role.candidates_with_override(participant.primary_model.as_deref());
                let result = self
                    .generate_validated(
                        run,
                        &def.id,
                        &candidates,
                        &role.system_prompt,
                        role.output_spec.as_deref(),
                        def,
                        inputs_text,
                        prior,
                        query,
                    )
                    .await
                    .map_err(|e| e.to_string());
                (role_id, result)
            }
        });

        let results = futures::future::join_all(participant_tasks).await;

        let mut sections = Vec::new();
        let mut failures = Vec::new();
        for (role_id, result) in results {
            match result {
                Ok(completion) => {
                    sections.push(format!("## {role_id}\n\n{}", completion.content));
                }
                Err(error) => {
                    failures.push(format!("participant '{role_id}': {error}"));
                }
            }
        }

        let merged = (!sections.is_empty()).then(|| sections.join("\n\n"));

        if failures.is_empty() {
            // Non-empty participants are enforced by config validation.
            Ok(merged.unwrap_or_default())
        } else {
            Err((failures.join("; "), merged))
        }
    }

    /// Dispatch-and-validate loop for one logical output.
    ///
    /// Resolves context, consults the response cache (single-flight), and
    /// drives bounded validation retries with feedback. A validation retry
    /// re-targets the same candidate list; only provider errors fail over.
    #[allow(clippy::too_many_arguments)]
    async fn generate_validated(
        &self,
        run: &PipelineRun,
        stage_id: &str,
        candidates: &[String],
        system_prompt: &str,
        output_spec: Option<&str>,
        def: &StageDefinition,
        inputs_text: &str,
        prior: Option<&str>,
        query: &str,
    ) -> Result<Completion, StageError> {
        let primary = candidates.first().map_or("", String::as_str);

        let context = self
            .memory
            .context_for(query, primary)
            .await
            .map_err(|e| StageError::Memory(e.to_string()))?;

        let base_prompt = compose_prompt(&def.task, inputs_text, &context, output_spec);
        let params = def.params.clone();
        let validation = def.validation.as_ref();
        let max_retries = if validation.is_some_and(|v| v.retry_on_failure) {
            def.max_retries
        } else {
            0
        };

        let mut feedback: Option<String> = None;
        let mut attempts = 0u32;

        loop {
            run.set_status(stage_id, StageStatus::Running);
            let prompt = match &feedback {
                None => base_prompt.clone(),
                Some(detail) => format!(
                    "{base_prompt}\n\nThe previous response failed validation: {detail}\n\nPlease fix the issues and try again."
                ),
            };

            let fp = fingerprint(primary, system_prompt, &prompt, &params);
            let request = DispatchRequest::new(stage_id, candidates.to_vec())
                .with_prompts(system_prompt, &prompt)
                .with_params(params.clone());

            let result: Result<Completion, StageError> = self
                .memory
                .cache()
                .get_or_compute(&fp, async {
                    let completion = self
                        .dispatcher
                        .dispatch(&request)
                        .await
                        .map_err(StageError::Dispatch)?;

                    run.set_status(stage_id, StageStatus::Validating);
                    if let Some(spec) = validation {
                        self.gate
                            .validate(&completion.content, spec, prior)
                            .await
                            .map_err(StageError::Validation)?;
                    }
                    Ok(completion)
                })
                .await;

            attempts += 1;
            run.update_record(stage_id, |r| r.attempts = r.attempts.max(attempts));

            match result {
                Ok(completion) => return Ok(completion),
                Err(StageError::Validation(failure)) if attempts <= max_retries => {
                    debug!(
                        stage = %stage_id,
                        attempt = attempts,
                        reason = %failure,
                        "Validation failed; retrying with feedback"
                    );
                    run.set_status(stage_id, StageStatus::Retrying);
                    self.events.try_emit(
                        "stage.retrying",
                        Some(serde_json::json!({
                            "stage": stage_id,
                            "attempt": attempts,
                            "reason": failure.to_string(),
                        })),
                    );
                    feedback = Some(failure.detail.clone());
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// The engine clock.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

/// Builds the user prompt for a stage attempt.
fn compose_prompt(
    task: &str,
    inputs_text: &str,
    context: &str,
    output_spec: Option<&str>,
) -> String {
    let mut prompt = String::from(task);
    if !inputs_text.is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(inputs_text);
    }
    if !context.is_empty() {
        prompt.push_str("\n\nRelevant context:\n");
        prompt.push_str(context);
    }
    if let Some(spec) = output_spec {
        prompt.push_str("\n\n");
        prompt.push_str(spec);
    }
    prompt
}

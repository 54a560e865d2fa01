use crate::config::OptimizerConfig;
use crate::error::{OptimizerError, Result};
use crate::llm::backend::{CredentialProvider, GenerationBackend};
use crate::llm::prompts::RequestBuilder;
use crate::llm::resilient::ResilientCaller;
use crate::llm::resolver::parse_theory;
use crate::llm::types::{GenerationRequest, OptimizerEvent, RequestPurpose};
use crate::repair::{send_event, FieldOptimizer};
use crate::sampling::{plan_fields, ComparisonResults, FieldPlan};
use crate::schema::{
    DiagnosticTheory, FieldOutcome, FieldSpec, FieldSummary, OptimizerRunSummary, RunStatus,
    SampledDocument,
};
use crate::templates::TemplateLibrary;
use crate::validator::PromptValidator;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What the operator asks the optimizer to work on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    /// Metadata template the fields belong to.
    pub template_key: Option<String>,
    pub fields: Vec<FieldSpec>,
    /// Output of the last comparison run against ground truth.
    pub comparison: Option<ComparisonResults>,
}

/// One optimization session and everything it has produced so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizerRun {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub step_index: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub sampled_docs: Vec<SampledDocument>,
    pub field_summaries: Vec<FieldSummary>,
    pub error: Option<String>,
}

impl Default for OptimizerRun {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimizerRun {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            status: RunStatus::Idle,
            step_index: 0,
            started_at: None,
            completed_at: None,
            sampled_docs: Vec::new(),
            field_summaries: Vec::new(),
            error: None,
        }
    }

    pub fn transition(&mut self, next: RunStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(OptimizerError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        info!("Run {}: {} -> {}", self.run_id, self.status, next);
        match next {
            RunStatus::Precheck => {
                self.started_at = Some(Utc::now());
                self.completed_at = None;
            }
            RunStatus::Review | RunStatus::Error => self.completed_at = Some(Utc::now()),
            _ => {}
        }
        self.status = next;
        self.step_index += 1;
        Ok(())
    }

    /// Moves to `error`, keeping every summary finalized so far.
    pub fn fail(&mut self, err: &OptimizerError) {
        error!("Run {} failed: {}", self.run_id, err);
        self.error = Some(err.to_string());
        if self.status.can_transition_to(RunStatus::Error) {
            self.status = RunStatus::Error;
            self.step_index += 1;
        }
        self.completed_at = Some(Utc::now());
    }

    /// Operator has seen the results; back to the resting state.
    pub fn acknowledge(&mut self) -> Result<()> {
        self.transition(RunStatus::Idle)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn summary(&self) -> OptimizerRunSummary {
        OptimizerRunSummary {
            run_id: self.run_id,
            sampled_docs: self.sampled_docs.clone(),
            field_summaries: self.field_summaries.clone(),
            started_at: self.started_at.unwrap_or_else(Utc::now),
            completed_at: self.completed_at,
        }
    }
}

/// Sequences precheck, sampling, diagnostics and prompting across all fields.
pub struct PromptOptimizer<B, C> {
    caller: ResilientCaller<B, C>,
    config: OptimizerConfig,
    validator: PromptValidator,
    templates: TemplateLibrary,
    progress: Option<Sender<OptimizerEvent>>,
    cancel: CancellationToken,
}

impl<B, C> PromptOptimizer<B, C>
where
    B: GenerationBackend,
    C: CredentialProvider,
{
    pub fn new(backend: B, credentials: C, config: OptimizerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            caller: ResilientCaller::new(backend, credentials, config.retry.clone()),
            validator: PromptValidator::new(config.validator.clone()),
            templates: TemplateLibrary::default(),
            config,
            progress: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_templates(mut self, templates: TemplateLibrary) -> Self {
        self.templates = templates;
        self
    }

    pub fn with_progress(mut self, progress: Sender<OptimizerEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cancellation_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Cancelling this token stops the run at the next field boundary.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn caller(&self) -> &ResilientCaller<B, C> {
        &self.caller
    }

    /// Executes a complete run. The returned run is in `review` or `error`.
    pub async fn run(&self, request: RunRequest) -> OptimizerRun {
        let mut run = OptimizerRun::new();
        if let Err(err) = self.drive(&mut run, request).await {
            run.fail(&err);
        }
        info!(
            "Run {} finished in {} with {} field summaries",
            run.run_id,
            run.status,
            run.field_summaries.len()
        );
        send_event(
            &self.progress,
            OptimizerEvent::RunFinished {
                run_id: run.run_id,
                status: run.status,
            },
        )
        .await;
        run
    }

    async fn drive(&self, run: &mut OptimizerRun, request: RunRequest) -> Result<()> {
        self.enter(run, RunStatus::Precheck).await?;
        let (fields, comparison) = precheck(request)?;

        self.enter(run, RunStatus::Sampling).await?;
        let (plans, finished) = plan_fields(&fields, &comparison, &self.config);
        run.sampled_docs = plans.iter().flat_map(|p| p.samples.clone()).collect();

        let mut ordered: Vec<(usize, FieldSummary)> = finished;
        let outcome = self.diagnose_and_prompt(run, plans, &mut ordered).await;
        ordered.sort_by_key(|(index, _)| *index);
        run.field_summaries = ordered.into_iter().map(|(_, summary)| summary).collect();
        outcome?;

        self.enter(run, RunStatus::Review).await
    }

    async fn diagnose_and_prompt(
        &self,
        run: &mut OptimizerRun,
        plans: Vec<FieldPlan>,
        ordered: &mut Vec<(usize, FieldSummary)>,
    ) -> Result<()> {
        if self.cancel.is_cancelled() {
            return cancel_all(plans, ordered);
        }
        self.enter(run, RunStatus::Diagnostics).await?;
        let theories = self.diagnose(&plans).await?;

        if self.cancel.is_cancelled() {
            return cancel_all(plans, ordered);
        }
        self.enter(run, RunStatus::Prompting).await?;
        self.prompt_fields(run, plans, &theories, ordered).await
    }

    async fn enter(&self, run: &mut OptimizerRun, status: RunStatus) -> Result<()> {
        run.transition(status)?;
        send_event(
            &self.progress,
            OptimizerEvent::StageEntered {
                run_id: run.run_id,
                status,
            },
        )
        .await;
        Ok(())
    }

    /// One root-cause theory per sampled document. Failed diagnoses are
    /// skipped unless the failure means no call can succeed.
    async fn diagnose(
        &self,
        plans: &[FieldPlan],
    ) -> Result<HashMap<String, Vec<DiagnosticTheory>>> {
        let builder = RequestBuilder::new(&self.config, &self.templates);
        let jobs = plans
            .iter()
            .flat_map(|plan| plan.samples.iter().map(move |sample| (plan, sample)));

        let results: Vec<Result<Option<DiagnosticTheory>>> = stream::iter(jobs)
            .map(|(plan, sample)| {
                let prompt = builder.diagnostic_request(
                    &plan.task.field,
                    &plan.task.current_instruction,
                    sample,
                );
                self.diagnose_document(prompt, sample)
            })
            .buffer_unordered(self.config.worker_limit)
            .collect()
            .await;

        let mut theories: HashMap<String, Vec<DiagnosticTheory>> = HashMap::new();
        for result in results {
            match result {
                Ok(Some(theory)) => theories
                    .entry(theory.field_key.clone())
                    .or_default()
                    .push(theory),
                Ok(None) => {}
                Err(err) if err.is_run_fatal() => return Err(err),
                Err(err) => warn!("Diagnosis skipped: {}", err),
            }
        }
        Ok(theories)
    }

    async fn diagnose_document(
        &self,
        prompt: String,
        sample: &SampledDocument,
    ) -> Result<Option<DiagnosticTheory>> {
        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        let request = GenerationRequest::new(
            RequestPurpose::Diagnostic,
            prompt,
            vec![sample.document_id.clone()],
        );
        let raw = self.caller.invoke(&request).await?;
        Ok(parse_theory(&raw).map(|theory| DiagnosticTheory {
            document_id: sample.document_id.clone(),
            field_key: sample.field_key.clone(),
            theory,
        }))
    }

    /// Optimizes fields concurrently up to the worker limit. Summaries land in
    /// `ordered` as they finish, so a cancelled run keeps them.
    async fn prompt_fields(
        &self,
        run: &mut OptimizerRun,
        plans: Vec<FieldPlan>,
        theories: &HashMap<String, Vec<DiagnosticTheory>>,
        ordered: &mut Vec<(usize, FieldSummary)>,
    ) -> Result<()> {
        let optimizer =
            FieldOptimizer::new(&self.caller, &self.config, &self.validator, &self.templates);
        let optimizer = &optimizer;
        let no_theories: Vec<DiagnosticTheory> = Vec::new();
        let no_theories = &no_theories;

        let mut finished = stream::iter(plans)
            .map(|plan| async move {
                let FieldPlan {
                    index,
                    mut task,
                    comparison,
                    ..
                } = plan;
                if self.cancel.is_cancelled() {
                    return (index, FieldSummary::for_task(&task, FieldOutcome::Cancelled));
                }
                send_event(
                    &self.progress,
                    OptimizerEvent::FieldStarted {
                        field_key: task.field.key.clone(),
                    },
                )
                .await;
                let diagnostics = theories.get(&task.field.key).unwrap_or(no_theories);
                let summary = optimizer
                    .optimize(&mut task, &comparison, diagnostics, &self.progress)
                    .await;
                (index, summary)
            })
            .buffer_unordered(self.config.worker_limit);

        let mut cancelled = false;
        while let Some((index, summary)) = finished.next().await {
            match summary.outcome {
                FieldOutcome::Cancelled => cancelled = true,
                FieldOutcome::Exhausted | FieldOutcome::Failed => {
                    warn!("{}", summary.explanation())
                }
                _ => info!("{}", summary.explanation()),
            }
            send_event(
                &self.progress,
                OptimizerEvent::FieldFinished {
                    field_key: summary.field_key.clone(),
                    outcome: summary.outcome,
                },
            )
            .await;
            run.step_index += 1;
            ordered.push((index, summary));
        }

        if cancelled {
            return Err(OptimizerError::Cancelled);
        }
        Ok(())
    }
}

fn cancel_all(plans: Vec<FieldPlan>, ordered: &mut Vec<(usize, FieldSummary)>) -> Result<()> {
    for plan in plans {
        ordered.push((
            plan.index,
            FieldSummary::for_task(&plan.task, FieldOutcome::Cancelled),
        ));
    }
    Err(OptimizerError::Cancelled)
}

fn precheck(request: RunRequest) -> Result<(Vec<FieldSpec>, ComparisonResults)> {
    let comparison = request.comparison.filter(|c| !c.is_empty()).ok_or_else(|| {
        OptimizerError::Precheck("no comparison results available; run a comparison first".to_string())
    })?;
    if request
        .template_key
        .as_deref()
        .map_or(true, |key| key.trim().is_empty())
    {
        return Err(OptimizerError::Precheck(
            "no metadata template selected".to_string(),
        ));
    }
    if request.fields.is_empty() {
        return Err(OptimizerError::Precheck(
            "the selected template has no fields to optimize".to_string(),
        ));
    }
    Ok((request.fields, comparison))
}

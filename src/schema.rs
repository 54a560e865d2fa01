use crate::error::{OptimizerError, Result};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    String,
    Date,
    Float,
    Integer,
    Enum,
    MultiSelect,
}

impl FieldType {
    /// Lenient parse of the type names used by metadata templates.
    /// Unknown names are treated as free text.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "date" | "datetime" => FieldType::Date,
            "float" | "number" | "decimal" | "currency" => FieldType::Float,
            "integer" | "int" => FieldType::Integer,
            "enum" | "select" | "singleselect" => FieldType::Enum,
            "multiselect" | "multi_select" | "multi-select" => FieldType::MultiSelect,
            _ => FieldType::String,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Float | FieldType::Integer)
    }

    pub fn is_choice(&self) -> bool {
        matches!(self, FieldType::Enum | FieldType::MultiSelect)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Date => "date",
            FieldType::Float => "float",
            FieldType::Integer => "integer",
            FieldType::Enum => "enum",
            FieldType::MultiSelect => "multiSelect",
        }
    }
}

/// Static description of one metadata field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldDescriptor {
    pub key: String,
    pub display_name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub options: Vec<String>,
}

impl FieldDescriptor {
    pub fn new(
        key: impl Into<String>,
        display_name: impl Into<String>,
        field_type: FieldType,
    ) -> Self {
        Self {
            key: key.into(),
            display_name: display_name.into(),
            field_type,
            options: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }
}

/// A field selected for optimization together with the instruction it uses today.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    #[serde(flatten)]
    pub descriptor: FieldDescriptor,
    #[serde(default)]
    pub current_instruction: String,
}

impl FieldSpec {
    pub fn new(descriptor: FieldDescriptor, current_instruction: impl Into<String>) -> Self {
        Self {
            descriptor,
            current_instruction: current_instruction.into(),
        }
    }
}

/// Lifecycle stage of an optimizer run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Idle,
    Precheck,
    Sampling,
    Diagnostics,
    Prompting,
    Review,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Precheck => "precheck",
            RunStatus::Sampling => "sampling",
            RunStatus::Diagnostics => "diagnostics",
            RunStatus::Prompting => "prompting",
            RunStatus::Review => "review",
            RunStatus::Error => "error",
        }
    }

    /// Review and error wait for the operator before the next run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Review | RunStatus::Error)
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Idle, Precheck)
                | (Precheck, Sampling)
                | (Sampling, Diagnostics)
                | (Diagnostics, Prompting)
                | (Prompting, Review)
                | (Precheck | Sampling | Diagnostics | Prompting, Error)
                | (Review | Error, Idle)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A document where the extracted value disagreed with ground truth.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FailureExample {
    pub document_id: String,
    pub predicted_value: String,
    pub expected_value: String,
}

/// A document where the extracted value matched ground truth.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SuccessExample {
    pub document_id: String,
    pub value: String,
}

/// Deduplicated, bounded list of instructions already tried for a field.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PromptHistory {
    limit: usize,
    entries: VecDeque<String>,
}

impl PromptHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            entries: VecDeque::with_capacity(limit),
        }
    }

    /// Records an instruction as most recent. A repeat moves to the front
    /// instead of being stored twice; the oldest entry falls off past the limit.
    pub fn push(&mut self, instruction: &str) {
        let trimmed = instruction.trim();
        if trimmed.is_empty() || self.limit == 0 {
            return;
        }
        let key = normalize_instruction(trimmed);
        self.entries.retain(|existing| normalize_instruction(existing) != key);
        self.entries.push_front(trimmed.to_string());
        self.entries.truncate(self.limit);
    }

    /// Most recent first.
    pub fn recent(&self, n: usize) -> Vec<&str> {
        self.entries.iter().take(n).map(String::as_str).collect()
    }

    pub fn contains(&self, instruction: &str) -> bool {
        let key = normalize_instruction(instruction);
        self.entries.iter().any(|existing| normalize_instruction(existing) == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Whitespace-collapsed, lowercased form used to compare instructions.
pub(crate) fn normalize_instruction(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Mutable work item for one field, owned by whichever worker is optimizing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldTask {
    pub field: FieldDescriptor,
    pub current_instruction: String,
    /// Set only once an instruction has passed the validator or is a fallback template.
    pub active_prompt: Option<String>,
    pub history: PromptHistory,
    pub iteration: u32,
    pub max_iterations: u32,
    /// Fixed for the rest of the field's iterations once set.
    pub exclude_entity: Option<String>,
    pub accuracy_before: f64,
    pub sampled_doc_ids: Vec<String>,
}

impl FieldTask {
    pub fn new(
        field: FieldDescriptor,
        current_instruction: impl Into<String>,
        max_iterations: u32,
        history_limit: usize,
    ) -> Self {
        Self {
            field,
            current_instruction: current_instruction.into(),
            active_prompt: None,
            history: PromptHistory::new(history_limit),
            iteration: 0,
            max_iterations,
            exclude_entity: None,
            accuracy_before: 0.0,
            sampled_doc_ids: Vec::new(),
        }
    }

    pub fn has_budget(&self) -> bool {
        self.iteration < self.max_iterations
    }

    /// Consumes one iteration, refusing to go past the budget.
    pub fn begin_iteration(&mut self) -> Result<u32> {
        if !self.has_budget() {
            return Err(OptimizerError::Exhausted {
                field: self.field.key.clone(),
                iterations: self.iteration,
            });
        }
        self.iteration += 1;
        Ok(self.iteration)
    }

    /// Remembers a rejected instruction so later requests avoid repeating it.
    pub fn record_rejected(&mut self, instruction: &str) {
        self.history.push(instruction);
    }

    pub fn accept(&mut self, instruction: String) {
        self.current_instruction = instruction.clone();
        self.active_prompt = Some(instruction);
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FieldOutcome {
    /// A generated instruction passed the validator.
    Improved,
    /// Generation could not be trusted; a fallback template was substituted.
    FallbackUsed,
    /// The iteration budget ran out; a fallback template was substituted.
    Exhausted,
    /// A non-retryable error stopped the field.
    Failed,
    /// The field already matched ground truth.
    Skipped,
    /// The run was cancelled before this field started.
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldSummary {
    pub field_key: String,
    pub field_name: String,
    pub accuracy_before: f64,
    pub sampled_doc_ids: Vec<String>,
    pub outcome: FieldOutcome,
    pub instruction: Option<String>,
    pub rationale: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub last_defects: Vec<String>,
    pub iterations_used: u32,
}

impl FieldSummary {
    pub fn for_task(task: &FieldTask, outcome: FieldOutcome) -> Self {
        Self {
            field_key: task.field.key.clone(),
            field_name: task.field.display_name.clone(),
            accuracy_before: task.accuracy_before,
            sampled_doc_ids: task.sampled_doc_ids.clone(),
            outcome,
            instruction: None,
            rationale: None,
            error: None,
            last_defects: Vec::new(),
            iterations_used: task.iteration,
        }
    }

    /// One-line review text for the operator.
    pub fn explanation(&self) -> String {
        match self.outcome {
            FieldOutcome::Improved => format!(
                "{}: new instruction ready ({})",
                self.field_name,
                self.rationale.as_deref().unwrap_or("no rationale given")
            ),
            FieldOutcome::FallbackUsed => format!(
                "{}: could not improve, used fallback template ({})",
                self.field_name,
                self.rationale.as_deref().unwrap_or("generated instruction unusable")
            ),
            FieldOutcome::Exhausted => {
                let defects = if self.last_defects.is_empty() {
                    "none recorded".to_string()
                } else {
                    self.last_defects.join("; ")
                };
                format!(
                    "{}: could not improve, exhausted {} iteration(s), used fallback template. Last defects: {}",
                    self.field_name, self.iterations_used, defects
                )
            }
            FieldOutcome::Failed => format!(
                "{}: could not improve, {}",
                self.field_name,
                self.error.as_deref().unwrap_or("unknown error")
            ),
            FieldOutcome::Skipped => format!(
                "{}: skipped, {}",
                self.field_name,
                self.error
                    .as_deref()
                    .unwrap_or("already matches ground truth")
            ),
            FieldOutcome::Cancelled => {
                format!("{}: not processed, run was cancelled", self.field_name)
            }
        }
    }
}

/// A failing document picked for diagnosis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SampledDocument {
    pub document_id: String,
    pub field_key: String,
    pub predicted_value: String,
    pub expected_value: String,
}

/// Root-cause theory for why the current instruction failed on one document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticTheory {
    pub document_id: String,
    pub field_key: String,
    pub theory: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OptimizerRunSummary {
    pub run_id: Uuid,
    pub sampled_docs: Vec<SampledDocument>,
    pub field_summaries: Vec<FieldSummary>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

//! # Extraction Prompt Optimizer
//!
//! A library for improving the per-field instructions an AI extraction model
//! follows when it reads business documents (contracts, invoices, leases)
//! and fills in metadata fields.
//!
//! ## Core Concepts
//!
//! - **Comparison Results**: per-field accuracy plus failing and succeeding documents,
//!   produced by scoring extracted values against ground truth
//! - **Field Task**: one field's work item: its current instruction, rejected attempts
//!   and iteration budget
//! - **Validator**: a deterministic quality gate that checks an instruction for
//!   location, synonyms, format, disambiguation and not-found handling
//! - **Fallback Templates**: hand-written instructions that always pass the gate,
//!   used whenever generated output cannot be trusted
//! - **Run**: `idle → precheck → sampling → diagnostics → prompting → review`, with
//!   `error` reachable from any working stage
//!
//! ## Example
//!
//! ```rust,ignore
//! use extraction_prompt_optimizer::*;
//!
//! let optimizer = PromptOptimizer::new(
//!     HttpGenerationBackend::new(),
//!     StaticTokenProvider::from_env("AI_ACCESS_TOKEN"),
//!     OptimizerConfig::default().with_env_overrides(),
//! )?;
//!
//! let run = optimizer
//!     .run(RunRequest {
//!         template_key: Some("contracts".to_string()),
//!         fields: vec![FieldSpec::new(
//!             FieldDescriptor::new("counterparty", "Counterparty Name", FieldType::String),
//!             "Extract the counterparty.",
//!         )],
//!         comparison: Some(comparison_results),
//!     })
//!     .await;
//!
//! for summary in &run.field_summaries {
//!     println!("{}", summary.explanation());
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod llm;
pub mod repair;
pub mod sampling;
pub mod schema;
pub mod templates;
pub mod validator;

pub use config::{OptimizerConfig, RetryPolicy, ValidatorConfig};
pub use engine::{OptimizerRun, PromptOptimizer, RunRequest};
pub use error::{classify, BackendError, ErrorClass, OptimizerError, Result};
pub use llm::*;
pub use repair::FieldOptimizer;
pub use sampling::{derive_excluded_entity, ComparisonResults, FieldComparison};
pub use schema::*;
pub use templates::{is_counterparty_field, template_for, TemplateLibrary, TemplateRequest};
pub use validator::{validate, PrecheckVerdict, PromptElement, PromptValidation, PromptValidator};

/// Runs one optimization pass with the default template library.
pub async fn optimize_fields<B, C>(
    backend: B,
    credentials: C,
    config: OptimizerConfig,
    request: RunRequest,
) -> Result<OptimizerRun>
where
    B: GenerationBackend,
    C: CredentialProvider,
{
    let optimizer = PromptOptimizer::new(backend, credentials, config)?;
    Ok(optimizer.run(request).await)
}

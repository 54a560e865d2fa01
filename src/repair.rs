use crate::config::OptimizerConfig;
use crate::error::{ErrorClass, OptimizerError};
use crate::llm::backend::{CredentialProvider, GenerationBackend};
use crate::llm::prompts::{GenerationRequestContext, RequestBuilder};
use crate::llm::resilient::ResilientCaller;
use crate::llm::resolver::ResponseResolver;
use crate::llm::types::{GenerationRequest, OptimizerEvent, RequestPurpose};
use crate::sampling::FieldComparison;
use crate::schema::{DiagnosticTheory, FieldOutcome, FieldSummary, FieldTask};
use crate::templates::{TemplateLibrary, TemplateRequest};
use crate::validator::{PromptValidation, PromptValidator};
use log::{debug, info, warn};
use tokio::sync::mpsc::Sender;

/// Drives one field through generate, validate and repair until an
/// instruction is accepted or the iteration budget runs out.
pub struct FieldOptimizer<'a, B, C> {
    caller: &'a ResilientCaller<B, C>,
    config: &'a OptimizerConfig,
    validator: &'a PromptValidator,
    templates: &'a TemplateLibrary,
}

struct Rejection {
    instruction: String,
    validation: PromptValidation,
}

impl<'a, B, C> FieldOptimizer<'a, B, C>
where
    B: GenerationBackend,
    C: CredentialProvider,
{
    pub fn new(
        caller: &'a ResilientCaller<B, C>,
        config: &'a OptimizerConfig,
        validator: &'a PromptValidator,
        templates: &'a TemplateLibrary,
    ) -> Self {
        Self {
            caller,
            config,
            validator,
            templates,
        }
    }

    /// Always produces a summary; call failures end up in it rather than
    /// propagating, so one field never takes the run down.
    pub async fn optimize(
        &self,
        task: &mut FieldTask,
        comparison: &FieldComparison,
        diagnostics: &[DiagnosticTheory],
        progress: &Option<Sender<OptimizerEvent>>,
    ) -> FieldSummary {
        let builder = RequestBuilder::new(self.config, self.templates);
        let resolver = ResponseResolver::new(self.validator, self.templates);
        let item_ids = self.item_ids(task, comparison);
        let mut last_rejection: Option<Rejection> = None;

        while task.has_budget() {
            let iteration = match task.begin_iteration() {
                Ok(iteration) => iteration,
                Err(_) => break,
            };

            let request = {
                let ctx = GenerationRequestContext::for_task(task, comparison, diagnostics, self.config);
                match &last_rejection {
                    None => GenerationRequest::new(
                        RequestPurpose::Generation,
                        builder.generation_request(&ctx),
                        item_ids.clone(),
                    ),
                    Some(rejection) => GenerationRequest::new(
                        RequestPurpose::Repair,
                        builder.repair_request(&ctx, &rejection.instruction, &rejection.validation),
                        item_ids.clone(),
                    ),
                }
            };

            let raw = match self.caller.invoke(&request).await {
                Ok(raw) => raw,
                Err(err) => return self.call_failed(task, err, last_rejection),
            };

            let field = task.field.clone();
            let exclude_entity = task.exclude_entity.clone();
            let template_request = TemplateRequest::new(&field.display_name, field.field_type)
                .with_options(&field.options)
                .with_exclude_entity(exclude_entity.as_deref());

            let resolved = match resolver.resolve(&raw, Some(&template_request)) {
                Ok(resolved) => resolved,
                Err(err) => return self.call_failed(task, err, last_rejection),
            };

            if resolved.is_fallback() {
                info!(
                    "Field {}: fallback template accepted on iteration {}",
                    field.display_name, iteration
                );
                task.accept(resolved.instruction.clone());
                let mut summary = FieldSummary::for_task(task, FieldOutcome::FallbackUsed);
                summary.instruction = Some(resolved.instruction);
                summary.rationale = Some(resolved.rationale);
                return summary;
            }

            let validation = self.validator.validate(&resolved.instruction);
            if validation.is_valid {
                info!(
                    "Field {}: instruction accepted on iteration {}",
                    field.display_name, iteration
                );
                task.accept(resolved.instruction.clone());
                let mut summary = FieldSummary::for_task(task, FieldOutcome::Improved);
                summary.instruction = Some(resolved.instruction);
                summary.rationale = Some(resolved.rationale);
                return summary;
            }

            debug!(
                "Field {}: iteration {} rejected: {}",
                field.display_name,
                iteration,
                validation.defects.join("; ")
            );
            send_event(
                progress,
                OptimizerEvent::AttemptRejected {
                    field_key: field.key.clone(),
                    iteration,
                    defects: validation.defects.clone(),
                },
            )
            .await;

            task.record_rejected(&resolved.instruction);
            last_rejection = Some(Rejection {
                instruction: resolved.instruction,
                validation,
            });
        }

        warn!(
            "Field {}: exhausted {} iteration(s) without a valid instruction",
            task.field.display_name, task.iteration
        );
        let error = OptimizerError::Exhausted {
            field: task.field.key.clone(),
            iterations: task.iteration,
        };
        self.exhausted(task, error.to_string(), last_rejection)
    }

    fn item_ids(&self, task: &FieldTask, comparison: &FieldComparison) -> Vec<String> {
        if !task.sampled_doc_ids.is_empty() {
            return task.sampled_doc_ids.iter().take(1).cloned().collect();
        }
        comparison
            .failures
            .first()
            .map(|f| vec![f.document_id.clone()])
            .unwrap_or_default()
    }

    fn call_failed(
        &self,
        task: &mut FieldTask,
        err: OptimizerError,
        last_rejection: Option<Rejection>,
    ) -> FieldSummary {
        // Retries running out is a budget problem, not a broken request.
        if err.class() == Some(ErrorClass::Exhausted) {
            warn!("Field {}: {}", task.field.display_name, err);
            return self.exhausted(task, err.to_string(), last_rejection);
        }

        warn!(
            "Field {}: stopped by non-retryable error: {}",
            task.field.display_name, err
        );
        let mut summary = FieldSummary::for_task(task, FieldOutcome::Failed);
        summary.error = Some(err.to_string());
        if let Some(rejection) = last_rejection {
            summary.last_defects = rejection.validation.defects;
        }
        summary
    }

    /// Budget ran out: the fallback template becomes the working instruction.
    fn exhausted(
        &self,
        task: &mut FieldTask,
        error: String,
        last_rejection: Option<Rejection>,
    ) -> FieldSummary {
        let template = {
            let request = TemplateRequest::new(&task.field.display_name, task.field.field_type)
                .with_options(&task.field.options)
                .with_exclude_entity(task.exclude_entity.as_deref());
            self.templates.template_for(&request)
        };
        task.accept(template.clone());

        let mut summary = FieldSummary::for_task(task, FieldOutcome::Exhausted);
        summary.instruction = Some(template);
        summary.rationale = Some(format!(
            "Used fallback template after {} attempt(s) without a valid instruction",
            task.iteration
        ));
        summary.error = Some(error);
        if let Some(rejection) = last_rejection {
            summary.last_defects = rejection.validation.defects;
        }
        summary
    }
}

pub(crate) async fn send_event(sender: &Option<Sender<OptimizerEvent>>, event: OptimizerEvent) {
    if let Some(tx) = sender {
        let _ = tx.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use crate::llm::backend::StaticTokenProvider;
    use crate::llm::types::AccessToken;
    use crate::schema::{FailureExample, FieldDescriptor, FieldType};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const GOOD: &str = "Look in the header block and the remittance section for the issuing company. The vendor may be labelled \"Vendor\", \"Supplier\", \"Seller\", \"Remit To\", \"Payee\" or \"From\". Return the exact legal name as written on the invoice, including suffixes such as Ltd or Inc. Do not return the customer named under Bill To, and ignore logistics carriers. If no vendor is named anywhere, return \"Not Present\".";

    const WEAK: &str = "Look in the header block and the remittance section for the company that issued the invoice and sent it to us for payment. Return the exact legal name as written on the invoice, including suffixes such as Ltd or Inc, and keep the punctuation of the original. Do not return the customer named under the billing heading, and ignore logistics carriers, banks and freight forwarders that appear elsewhere on the page.";

    struct Scripted {
        replies: Mutex<VecDeque<std::result::Result<String, BackendError>>>,
        prompts: Mutex<Vec<GenerationRequest>>,
    }

    impl Scripted {
        fn new(replies: Vec<std::result::Result<String, BackendError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl GenerationBackend for Scripted {
        async fn generate(
            &self,
            request: &GenerationRequest,
            _token: &AccessToken,
        ) -> std::result::Result<String, BackendError> {
            self.prompts.lock().unwrap().push(request.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(BackendError::Network("script exhausted".to_string())))
        }
    }

    fn reply(instruction: &str) -> std::result::Result<String, BackendError> {
        Ok(serde_json::json!({"newPrompt": instruction, "reasoning": "revised"}).to_string())
    }

    fn fixtures() -> (FieldTask, FieldComparison) {
        let field = FieldDescriptor::new("vendor", "Vendor Name", FieldType::String);
        let mut task = FieldTask::new(field, "Extract the vendor.", 3, 5);
        task.sampled_doc_ids = vec!["11".to_string()];
        let comparison = FieldComparison {
            field_key: "vendor".to_string(),
            accuracy: 0.5,
            failures: vec![FailureExample {
                document_id: "11".to_string(),
                predicted_value: "Bank of Nowhere".to_string(),
                expected_value: "Globex Ltd".to_string(),
            }],
            successes: Vec::new(),
        };
        (task, comparison)
    }

    #[tokio::test]
    async fn test_accepts_first_valid_instruction() {
        let config = OptimizerConfig::default();
        let validator = PromptValidator::new(config.validator.clone());
        let templates = TemplateLibrary::default();
        let caller = ResilientCaller::new(
            Scripted::new(vec![reply(GOOD)]),
            StaticTokenProvider::new("t"),
            config.retry.clone(),
        );
        let optimizer = FieldOptimizer::new(&caller, &config, &validator, &templates);
        let (mut task, comparison) = fixtures();

        let summary = optimizer.optimize(&mut task, &comparison, &[], &None).await;
        assert_eq!(summary.outcome, FieldOutcome::Improved);
        assert_eq!(summary.instruction.as_deref(), Some(GOOD));
        assert_eq!(summary.iterations_used, 1);
        assert_eq!(task.active_prompt.as_deref(), Some(GOOD));

        let prompts = caller.backend().prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].purpose, RequestPurpose::Generation);
        assert_eq!(prompts[0].item_ids, vec!["11".to_string()]);
    }

    #[tokio::test]
    async fn test_repairs_after_rejection() {
        let config = OptimizerConfig::default();
        let validator = PromptValidator::new(config.validator.clone());
        let templates = TemplateLibrary::default();
        assert!(!validator.validate(WEAK).is_valid);

        let caller = ResilientCaller::new(
            Scripted::new(vec![reply(WEAK), reply(GOOD)]),
            StaticTokenProvider::new("t"),
            config.retry.clone(),
        );
        let optimizer = FieldOptimizer::new(&caller, &config, &validator, &templates);
        let (mut task, comparison) = fixtures();

        let summary = optimizer.optimize(&mut task, &comparison, &[], &None).await;
        assert_eq!(summary.outcome, FieldOutcome::Improved);
        assert_eq!(summary.iterations_used, 2);
        assert!(task.history.contains(WEAK));

        let prompts = caller.backend().prompts.lock().unwrap();
        assert_eq!(prompts[1].purpose, RequestPurpose::Repair);
        assert!(prompts[1].prompt.contains(WEAK));
        assert!(prompts[1].prompt.contains("SYNONYMS: need 6 distinct quoted phrases"));
    }

    #[tokio::test]
    async fn test_later_repairs_still_see_first_rejection() {
        let config = OptimizerConfig::default();
        let validator = PromptValidator::new(config.validator.clone());
        let templates = TemplateLibrary::default();
        let other_weak = WEAK.replace("logistics carriers", "shipping agents");
        assert!(!validator.validate(&other_weak).is_valid);

        let caller = ResilientCaller::new(
            Scripted::new(vec![reply(WEAK), reply(&other_weak), reply(&other_weak)]),
            StaticTokenProvider::new("t"),
            config.retry.clone(),
        );
        let optimizer = FieldOptimizer::new(&caller, &config, &validator, &templates);
        let (mut task, comparison) = fixtures();

        let summary = optimizer.optimize(&mut task, &comparison, &[], &None).await;
        assert_eq!(summary.outcome, FieldOutcome::Exhausted);
        assert_eq!(task.history.len(), 2);

        let prompts = caller.backend().prompts.lock().unwrap();
        assert_eq!(prompts.len(), 3);
        assert_eq!(prompts[2].purpose, RequestPurpose::Repair);
        assert!(prompts[2].prompt.contains("## PREVIOUS INSTRUCTIONS THAT FAILED"));
        assert!(prompts[2].prompt.contains(WEAK));
        assert!(prompts[2].prompt.contains(other_weak.as_str()));
    }

    #[tokio::test]
    async fn test_fallback_from_resolver_is_accepted() {
        let config = OptimizerConfig::default();
        let validator = PromptValidator::new(config.validator.clone());
        let templates = TemplateLibrary::default();
        let caller = ResilientCaller::new(
            Scripted::new(vec![reply("Extract the vendor name.")]),
            StaticTokenProvider::new("t"),
            config.retry.clone(),
        );
        let optimizer = FieldOptimizer::new(&caller, &config, &validator, &templates);
        let (mut task, comparison) = fixtures();

        let summary = optimizer.optimize(&mut task, &comparison, &[], &None).await;
        assert_eq!(summary.outcome, FieldOutcome::FallbackUsed);
        assert!(summary
            .rationale
            .as_deref()
            .unwrap()
            .contains("24 characters, needed 350+"));
        assert!(validator.validate(summary.instruction.as_deref().unwrap()).is_valid);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_field() {
        let config = OptimizerConfig::default();
        let validator = PromptValidator::new(config.validator.clone());
        let templates = TemplateLibrary::default();
        let caller = ResilientCaller::new(
            Scripted::new(vec![Err(BackendError::Http {
                status: 403,
                body: "forbidden".to_string(),
            })]),
            StaticTokenProvider::new("t"),
            config.retry.clone(),
        );
        let optimizer = FieldOptimizer::new(&caller, &config, &validator, &templates);
        let (mut task, comparison) = fixtures();

        let summary = optimizer.optimize(&mut task, &comparison, &[], &None).await;
        assert_eq!(summary.outcome, FieldOutcome::Failed);
        assert!(summary.instruction.is_none());
        assert!(summary.error.as_deref().unwrap().contains("permission"));
        assert!(task.active_prompt.is_none());
        assert_eq!(caller.backend().prompts.lock().unwrap().len(), 1);
    }
}

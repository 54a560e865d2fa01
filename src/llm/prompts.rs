// Request text for the generation, repair and diagnostic calls

use crate::config::OptimizerConfig;
use crate::llm::types::generated_instruction_schema;
use crate::llm::utils::{sample_options, truncate_chars};
use crate::sampling::{select_failures, FieldComparison};
use crate::schema::{
    normalize_instruction, DiagnosticTheory, FailureExample, FieldDescriptor, FieldTask,
    SampledDocument, SuccessExample,
};
use crate::templates::{is_counterparty_field, TemplateLibrary, TemplateRequest};
use crate::validator::{PromptElement, PromptValidation};
use std::fmt::Write;

pub const GENERATION_INSTRUCTIONS: &str = r#"
You are an expert at writing extraction instructions for an AI model that reads business documents and fills in one metadata field at a time.

## YOUR MISSION
The current instruction for the field below produces wrong values on some documents. Write a complete replacement instruction that fixes the failures listed below without breaking the documents that already succeed.

## WHAT A GOOD INSTRUCTION CONTAINS
1. LOCATION: say where to look ("Look in the ...", section names, page regions, numbered places to check in order).
2. SYNONYMS: list at least 6 alternative labels the value appears under, each in double quotes.
3. FORMAT: state the exact output format (date pattern, number precision, exact legal name, one of the listed options).
4. DISAMBIGUATION: add at least one "Do not ..." clause naming the wrong values this field gets confused with.
5. NOT FOUND: say exactly what to return when the value is missing from the document.

## RULES
- Write the instruction as plain prose for the extraction model, at least 350 characters long.
- Never write a one-line instruction such as "Extract the X from this document".
- Never leave placeholders like [FIELD_NAME] or TODO in the text.
- Learn from the failures: name the labels and locations that led to the wrong value and steer away from them.
"#;

pub const REPAIR_INSTRUCTIONS: &str = r#"
You are repairing an extraction instruction that was rejected by an automated quality check.

## YOUR MISSION
Rewrite the rejected instruction below so that it fixes EVERY problem listed under PROBLEMS TO FIX, while keeping everything that already works (its locations, labels and rules).

## RULES
- Return the full corrected instruction, not a diff or a list of changes.
- Keep it plain prose for the extraction model, at least 350 characters long.
- Do not drop any element the rejected instruction already had.
"#;

pub const DIAGNOSTIC_INSTRUCTIONS: &str = r#"
You are diagnosing why a document extraction instruction produced the wrong value for one document.

## YOUR MISSION
Read the attached document. Compare what the instruction extracted with the correct value and explain the most likely root cause in two or three sentences. Typical causes: the instruction looks in the wrong place, the document uses a label the instruction does not mention, the value was found but formatted differently, the wrong party or date was picked, or the value is genuinely absent.

## OUTPUT FORMAT
Respond with a single JSON object and nothing else:
{"theory": "<two or three sentences>"}
"#;

const CONTRACT_INSTRUCTIONS: &str = r#"
## DOCUMENT TYPE: CONTRACTS
These documents are commercial agreements. Parties are introduced in the preamble and signature blocks; dates live in the preamble, the term section and the signature blocks; renewal, termination and governing law have their own numbered clauses near the end. Amendments and exhibits may restate values, and the operative value is the one in the body of the agreement.
"#;

const INVOICE_INSTRUCTIONS: &str = r#"
## DOCUMENT TYPE: INVOICES
These documents are supplier invoices. The issuer's details sit in the letterhead and remittance block, the customer sits under "Bill To"/"Ship To", and amounts appear in the totals box at the bottom of the line-item table. Subtotals, tax lines and amounts due often sit next to each other and are easy to confuse.
"#;

const LEASE_INSTRUCTIONS: &str = r#"
## DOCUMENT TYPE: LEASES
These documents are property or equipment leases. Landlord and tenant are named in the opening paragraph, the premises or equipment is described in its own section, and rent, commencement and expiration appear in a summary of basic terms or in the term and rent clauses. Options to renew or extend are separate from the initial term.
"#;

const PURCHASE_ORDER_INSTRUCTIONS: &str = r#"
## DOCUMENT TYPE: PURCHASE ORDERS
These documents are purchase orders issued by a buyer to a supplier. The buyer owns the letterhead, the supplier appears under "Vendor" or "Supplier", and the PO number and order date sit in the header box. Delivery dates and payment terms usually appear below the line items.
"#;

/// Built-in instruction set for a document-type hint, matched case-insensitively.
pub fn document_type_instructions(hint: &str) -> Option<&'static str> {
    let hint = hint.trim().to_ascii_lowercase();
    if hint.contains("purchase") || hint == "po" {
        Some(PURCHASE_ORDER_INSTRUCTIONS)
    } else if hint.contains("invoice") || hint.contains("bill") {
        Some(INVOICE_INSTRUCTIONS)
    } else if hint.contains("lease") || hint.contains("rental") {
        Some(LEASE_INSTRUCTIONS)
    } else if hint.contains("contract") || hint.contains("agreement") {
        Some(CONTRACT_INSTRUCTIONS)
    } else {
        None
    }
}

/// Everything one generation or repair request needs, built fresh per attempt.
#[derive(Debug, Clone)]
pub struct GenerationRequestContext<'a> {
    pub field: &'a FieldDescriptor,
    pub current_instruction: &'a str,
    pub failures: Vec<&'a FailureExample>,
    pub successes: &'a [SuccessExample],
    pub diagnostics: &'a [DiagnosticTheory],
    pub previous_instructions: Vec<&'a str>,
    pub document_type: Option<&'a str>,
    pub exclude_entity: Option<&'a str>,
    pub iteration: u32,
}

impl<'a> GenerationRequestContext<'a> {
    pub fn for_task(
        task: &'a FieldTask,
        comparison: &'a FieldComparison,
        diagnostics: &'a [DiagnosticTheory],
        config: &'a OptimizerConfig,
    ) -> Self {
        let success_count = comparison.successes.len().min(config.max_success_examples);
        Self {
            field: &task.field,
            current_instruction: &task.current_instruction,
            failures: select_failures(&comparison.failures, config.max_failure_examples),
            successes: &comparison.successes[..success_count],
            diagnostics,
            // One spare, so a repair request can drop the instruction it already quotes.
            previous_instructions: task
                .history
                .recent(config.previous_instructions_in_request + 1),
            document_type: config.document_type.as_deref(),
            exclude_entity: task.exclude_entity.as_deref(),
            iteration: task.iteration,
        }
    }
}

/// Assembles request text for the three kinds of AI calls the optimizer makes.
pub struct RequestBuilder<'a> {
    config: &'a OptimizerConfig,
    templates: &'a TemplateLibrary,
}

impl<'a> RequestBuilder<'a> {
    pub fn new(config: &'a OptimizerConfig, templates: &'a TemplateLibrary) -> Self {
        Self { config, templates }
    }

    pub fn generation_request(&self, ctx: &GenerationRequestContext<'_>) -> String {
        let mut out = String::new();

        match self.config.custom_instructions.as_deref() {
            Some(custom) if !custom.trim().is_empty() => {
                out.push_str(custom.trim());
                out.push_str("\n\n");
                self.push_field(&mut out, ctx);
            }
            _ => {
                if let Some(doc_type) = ctx.document_type.and_then(document_type_instructions) {
                    out.push_str(doc_type.trim());
                    out.push_str("\n\n");
                }
                out.push_str(GENERATION_INSTRUCTIONS.trim());
                out.push_str("\n\n");
                self.push_field(&mut out, ctx);
                self.push_style_example(&mut out, ctx);
            }
        }

        self.push_context(&mut out, ctx);
        self.push_previous(&mut out, ctx, None);
        push_output_contract(&mut out);
        out
    }

    /// Repair request for an instruction the validator rejected.
    pub fn repair_request(
        &self,
        ctx: &GenerationRequestContext<'_>,
        rejected: &str,
        validation: &PromptValidation,
    ) -> String {
        let mut out = String::new();
        out.push_str(REPAIR_INSTRUCTIONS.trim());
        out.push_str("\n\n");
        self.push_field(&mut out, ctx);

        out.push_str("## REJECTED INSTRUCTION\n");
        out.push_str(rejected);
        out.push_str("\n\n");

        out.push_str("## PROBLEMS TO FIX\n");
        for line in repair_guidance(validation, self.config) {
            let _ = writeln!(out, "- {}", line);
        }
        out.push('\n');

        self.push_context(&mut out, ctx);
        self.push_previous(&mut out, ctx, Some(rejected));
        push_output_contract(&mut out);
        out
    }

    pub fn diagnostic_request(
        &self,
        field: &FieldDescriptor,
        current_instruction: &str,
        document: &SampledDocument,
    ) -> String {
        let limit = self.config.value_truncate_chars;
        let mut out = String::new();
        out.push_str(DIAGNOSTIC_INSTRUCTIONS.trim());
        out.push_str("\n\n## CASE\n");
        let _ = writeln!(
            out,
            "Field: {} ({})",
            field.display_name,
            field.field_type.as_str()
        );
        let _ = writeln!(out, "Document: {}", document.document_id);
        let _ = writeln!(out, "Current instruction: {}", current_instruction.trim());
        let _ = writeln!(
            out,
            "Extracted value: \"{}\"",
            truncate_chars(&document.predicted_value, limit)
        );
        let _ = writeln!(
            out,
            "Correct value: \"{}\"",
            truncate_chars(&document.expected_value, limit)
        );
        out
    }

    fn push_field(&self, out: &mut String, ctx: &GenerationRequestContext<'_>) {
        out.push_str("## FIELD\n");
        let _ = writeln!(out, "Name: {}", ctx.field.display_name);
        let _ = writeln!(out, "Key: {}", ctx.field.key);
        let _ = writeln!(out, "Type: {}", ctx.field.field_type.as_str());
        let _ = writeln!(out, "Attempt: {}", ctx.iteration.max(1));
        out.push('\n');

        out.push_str("## CURRENT INSTRUCTION\n");
        if ctx.current_instruction.trim().is_empty() {
            out.push_str("(none configured)\n\n");
        } else {
            out.push_str(ctx.current_instruction.trim());
            out.push_str("\n\n");
        }
    }

    fn push_style_example(&self, out: &mut String, ctx: &GenerationRequestContext<'_>) {
        let request = TemplateRequest::new(&ctx.field.display_name, ctx.field.field_type)
            .with_options(&ctx.field.options)
            .with_exclude_entity(ctx.exclude_entity);
        out.push_str("## STYLE EXAMPLE\n");
        out.push_str(
            "An instruction with the right structure for this kind of field. Use it as a model for shape and detail, not as the answer:\n",
        );
        out.push_str(&self.templates.template_for(&request));
        out.push_str("\n\n");
    }

    /// Failures, successes, options, exclusion and diagnoses.
    fn push_context(&self, out: &mut String, ctx: &GenerationRequestContext<'_>) {
        let limit = self.config.value_truncate_chars;

        if !ctx.failures.is_empty() {
            out.push_str("## FAILURES (extracted value vs correct value)\n");
            for (i, failure) in ctx.failures.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "{}. Document {}: extracted \"{}\" but the correct value is \"{}\"",
                    i + 1,
                    failure.document_id,
                    truncate_chars(&failure.predicted_value, limit),
                    truncate_chars(&failure.expected_value, limit)
                );
            }
            out.push('\n');
        }

        if !ctx.successes.is_empty() {
            out.push_str("## SUCCESSES (keep these working)\n");
            for (i, success) in ctx.successes.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "{}. Document {}: correctly extracted \"{}\"",
                    i + 1,
                    success.document_id,
                    truncate_chars(&success.value, limit)
                );
            }
            out.push('\n');
        }

        if ctx.field.field_type.is_choice() && !ctx.field.options.is_empty() {
            let (sample, omitted) =
                sample_options(&ctx.field.options, self.config.option_sample_size);
            out.push_str("## ALLOWED OPTIONS\n");
            let quoted = sample
                .iter()
                .map(|o| format!("\"{}\"", o))
                .collect::<Vec<_>>()
                .join(", ");
            out.push_str(&quoted);
            if omitted > 0 {
                let _ = write!(out, " (and {} more)", omitted);
            }
            out.push_str("\n\n");
        }

        if let Some(entity) = ctx.exclude_entity {
            if is_counterparty_field(&ctx.field.display_name) {
                out.push_str("## EXCLUSION\n");
                let _ = writeln!(
                    out,
                    "\"{}\" is the organization that owns these documents. It is never the answer for this field; the instruction must tell the model not to return \"{}\" or its affiliates.",
                    entity, entity
                );
                out.push('\n');
            }
        }

        if !ctx.diagnostics.is_empty() {
            out.push_str("## ROOT-CAUSE THEORIES\n");
            for theory in ctx.diagnostics.iter().take(3) {
                let _ = writeln!(
                    out,
                    "- Document {}: {}",
                    theory.document_id,
                    truncate_chars(&theory.theory, limit * 2)
                );
            }
            out.push('\n');
        }
    }

    fn push_previous(
        &self,
        out: &mut String,
        ctx: &GenerationRequestContext<'_>,
        quoted: Option<&str>,
    ) {
        let skip = quoted.map(normalize_instruction);
        let previous: Vec<&str> = ctx
            .previous_instructions
            .iter()
            .copied()
            .filter(|p| skip.as_deref() != Some(normalize_instruction(p).as_str()))
            .take(self.config.previous_instructions_in_request)
            .collect();
        if previous.is_empty() {
            return;
        }
        out.push_str("## PREVIOUS INSTRUCTIONS THAT FAILED (do not repeat them)\n");
        for (i, instruction) in previous.iter().enumerate() {
            let _ = writeln!(out, "{}. {}", i + 1, instruction);
        }
        out.push('\n');
    }
}

/// Itemized problems for a rejected instruction: hard failures first, then
/// one guidance line per missing element, then soft defects.
pub fn repair_guidance(
    validation: &PromptValidation,
    config: &OptimizerConfig,
) -> Vec<String> {
    let mut lines = Vec::new();
    let min_length = config.validator.min_length;
    if validation.char_count < min_length {
        lines.push(format!(
            "LENGTH: the instruction is {} characters; it must be at least {}.",
            validation.char_count, min_length
        ));
    }
    if validation.is_generic {
        lines.push(
            "GENERIC: do not write a bare \"Extract the X\" sentence; spell out where to look and how to answer."
                .to_string(),
        );
    }
    for element in PromptElement::ALL {
        if validation.is_missing(element) {
            lines.push(element.guidance(validation, &config.validator));
        }
    }
    for defect in &validation.other_defects {
        lines.push(format!("OTHER: {}", defect));
    }
    lines
}

fn push_output_contract(out: &mut String) {
    out.push_str("## OUTPUT FORMAT\n");
    out.push_str(
        "Respond with exactly one JSON object and nothing else: no markdown, no commentary before or after. It must match this schema:\n",
    );
    out.push_str(&generated_instruction_schema());
    out.push_str(
        "\nPut the complete instruction in \"newPrompt\" and a one or two sentence explanation in \"reasoning\".\n",
    );
}

use crate::error::{OptimizerError, Result};
use crate::llm::types::GeneratedInstruction;
use crate::llm::utils::{clean_json_output, decode_json_string, strip_code_fence, unescape_one_level};
use crate::templates::{TemplateLibrary, TemplateRequest};
use crate::validator::PromptValidator;
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static NEW_PROMPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""newPrompt"\s*:\s*"((?:[^"\\]|\\.)*)""#).unwrap());

static REASONING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""reasoning"\s*:\s*"((?:[^"\\]|\\.)*)""#).unwrap());

static LOOSE_NEW_PROMPT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?is)newPrompt['"]?\s*[:=]\s*['"]?(.+?)['"]?\s*(?:,\s*['"]?reasoning\b|\}|$)"#,
    )
    .unwrap()
});

static LOOSE_REASONING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)reasoning['"]?\s*[:=]\s*['"]?(.+?)['"]?\s*(?:,\s*['"]?newPrompt\b|\}|$)"#)
        .unwrap()
});

static THEORY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""theory"\s*:\s*"((?:[^"\\]|\\.)*)""#).unwrap());

/// How an instruction was pulled out of the raw response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExtractionStrategy {
    Structured,
    KeyValue,
    LooseFragment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InstructionSource {
    Generated,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedInstruction {
    pub instruction: String,
    /// Always set: the model's reasoning, or why a fallback was used.
    pub rationale: String,
    pub source: InstructionSource,
    pub strategy: Option<ExtractionStrategy>,
}

impl ResolvedInstruction {
    pub fn is_fallback(&self) -> bool {
        self.source == InstructionSource::Fallback
    }
}

/// Turns raw model output into an instruction, substituting a fallback
/// template when the output cannot be trusted.
pub struct ResponseResolver<'a> {
    validator: &'a PromptValidator,
    templates: &'a TemplateLibrary,
}

impl<'a> ResponseResolver<'a> {
    pub fn new(validator: &'a PromptValidator, templates: &'a TemplateLibrary) -> Self {
        Self {
            validator,
            templates,
        }
    }

    /// Without `field`, an unusable response is an error rather than a fallback.
    pub fn resolve(
        &self,
        raw: &str,
        field: Option<&TemplateRequest<'_>>,
    ) -> Result<ResolvedInstruction> {
        let Some((generated, strategy)) = extract_instruction(raw) else {
            return self.fallback(
                field,
                "the response could not be parsed as a newPrompt object".to_string(),
                None,
                true,
            );
        };
        debug!("Extracted instruction using {:?} strategy", strategy);

        let verdict = self.validator.precheck(&generated.new_prompt);
        if !verdict.passed() {
            return self.fallback(field, verdict.reason(), Some(strategy), false);
        }

        let rationale = if generated.reasoning.trim().is_empty() {
            "Generated instruction accepted; the model gave no reasoning".to_string()
        } else {
            generated.reasoning.trim().to_string()
        };

        Ok(ResolvedInstruction {
            instruction: generated.new_prompt,
            rationale,
            source: InstructionSource::Generated,
            strategy: Some(strategy),
        })
    }

    fn fallback(
        &self,
        field: Option<&TemplateRequest<'_>>,
        reason: String,
        strategy: Option<ExtractionStrategy>,
        unparseable: bool,
    ) -> Result<ResolvedInstruction> {
        let Some(request) = field else {
            return Err(if unparseable {
                OptimizerError::Parse(reason)
            } else {
                OptimizerError::Validation(reason)
            });
        };

        warn!(
            "Using fallback template for {}: {}",
            request.field_name, reason
        );
        Ok(ResolvedInstruction {
            instruction: self.templates.template_for(request),
            rationale: format!("Used fallback template because {}", reason),
            source: InstructionSource::Fallback,
            strategy,
        })
    }
}

/// Tries each extraction strategy in order of preference, first on the raw
/// text and then on a once-unescaped copy.
pub fn extract_instruction(raw: &str) -> Option<(GeneratedInstruction, ExtractionStrategy)> {
    if let Some(found) = extract_from(raw) {
        return Some(found);
    }
    if raw.contains("\\\"newPrompt") {
        return extract_from(&unescape_one_level(raw));
    }
    None
}

fn extract_from(raw: &str) -> Option<(GeneratedInstruction, ExtractionStrategy)> {
    parse_structured(raw)
        .map(|g| (g, ExtractionStrategy::Structured))
        .or_else(|| parse_key_value(raw).map(|g| (g, ExtractionStrategy::KeyValue)))
        .or_else(|| parse_loose(raw).map(|g| (g, ExtractionStrategy::LooseFragment)))
}

fn parse_structured(raw: &str) -> Option<GeneratedInstruction> {
    let body = strip_code_fence(raw);
    serde_json::from_str::<GeneratedInstruction>(body)
        .or_else(|_| serde_json::from_str::<GeneratedInstruction>(clean_json_output(body)))
        .ok()
}

fn parse_key_value(raw: &str) -> Option<GeneratedInstruction> {
    let captures = NEW_PROMPT_RE.captures(raw)?;
    let new_prompt = decode_json_string(captures.get(1)?.as_str());
    let reasoning = REASONING_RE
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| decode_json_string(m.as_str()))
        .unwrap_or_default();
    Some(GeneratedInstruction {
        new_prompt,
        reasoning,
    })
}

fn parse_loose(raw: &str) -> Option<GeneratedInstruction> {
    let captures = LOOSE_NEW_PROMPT_RE.captures(raw)?;
    let new_prompt = captures.get(1)?.as_str().trim().to_string();
    if new_prompt.is_empty() {
        return None;
    }
    let reasoning = LOOSE_REASONING_RE
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();
    Some(GeneratedInstruction {
        new_prompt,
        reasoning,
    })
}

#[derive(Deserialize)]
struct TheoryResponse {
    theory: String,
}

/// Root-cause text from a diagnostic response. Unstructured answers are
/// kept as-is; an empty answer yields `None`.
pub fn parse_theory(raw: &str) -> Option<String> {
    let body = strip_code_fence(raw);
    let theory = serde_json::from_str::<TheoryResponse>(clean_json_output(body))
        .map(|r| r.theory)
        .ok()
        .or_else(|| {
            THEORY_RE
                .captures(body)
                .and_then(|c| c.get(1))
                .map(|m| decode_json_string(m.as_str()))
        })
        .unwrap_or_else(|| body.to_string());
    let theory = theory.trim();
    (!theory.is_empty()).then(|| theory.to_string())
}

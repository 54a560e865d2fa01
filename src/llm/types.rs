use crate::schema::{FieldOutcome, RunStatus};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestPurpose {
    Generation,
    Repair,
    Diagnostic,
}

/// One text-generation call against the AI backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub purpose: RequestPurpose,
    pub prompt: String,
    /// Documents the backend should read while answering.
    pub item_ids: Vec<String>,
}

impl GenerationRequest {
    pub fn new(purpose: RequestPurpose, prompt: impl Into<String>, item_ids: Vec<String>) -> Self {
        Self {
            purpose,
            prompt: prompt.into(),
            item_ids,
        }
    }
}

/// The object every generation and repair request asks the model to return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GeneratedInstruction {
    #[serde(rename = "newPrompt")]
    #[schemars(
        description = "The complete replacement extraction instruction, written as plain text for the extraction model."
    )]
    pub new_prompt: String,

    #[serde(default)]
    #[schemars(description = "One or two sentences explaining what changed and why.")]
    pub reasoning: String,
}

/// Pretty-printed JSON schema of [`GeneratedInstruction`].
pub fn generated_instruction_schema() -> String {
    let schema = schemars::schema_for!(GeneratedInstruction);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| {
        r#"{"type":"object","required":["newPrompt"],"properties":{"newPrompt":{"type":"string"},"reasoning":{"type":"string"}}}"#
            .to_string()
    })
}

/// Bearer token handed out by a credential provider for a single request.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OptimizerEvent {
    StageEntered {
        run_id: Uuid,
        status: RunStatus,
    },
    FieldStarted {
        field_key: String,
    },
    AttemptRejected {
        field_key: String,
        iteration: u32,
        defects: Vec<String>,
    },
    FieldFinished {
        field_key: String,
        outcome: FieldOutcome,
    },
    RunFinished {
        run_id: Uuid,
        status: RunStatus,
    },
}

use crate::error::BackendError;
use crate::llm::backend::GenerationBackend;
use crate::llm::types::{AccessToken, GenerationRequest};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

pub const DEFAULT_AI_BASE_URL: &str = "https://api.box.com/2.0";

#[derive(Debug, Serialize)]
struct AskItem<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    item_type: &'static str,
}

#[derive(Debug, Serialize)]
struct AskRequest<'a> {
    mode: &'static str,
    prompt: &'a str,
    items: Vec<AskItem<'a>>,
}

#[derive(Debug, Deserialize)]
struct AskResponse {
    answer: Option<String>,
}

fn ask_payload(request: &GenerationRequest) -> AskRequest<'_> {
    let mode = if request.item_ids.len() > 1 {
        "multiple_item_qa"
    } else {
        "single_item_qa"
    };
    AskRequest {
        mode,
        prompt: &request.prompt,
        items: request
            .item_ids
            .iter()
            .map(|id| AskItem {
                id: id.as_str(),
                item_type: "file",
            })
            .collect(),
    }
}

fn transport_error(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout(err.to_string())
    } else if err.is_decode() {
        BackendError::InvalidResponse(err.to_string())
    } else {
        BackendError::Network(err.to_string())
    }
}

/// Document question-answering endpoint used for every generation call.
#[derive(Clone)]
pub struct HttpGenerationBackend {
    client: Client,
    base_url: String,
}

impl HttpGenerationBackend {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_AI_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    fn ask_url(&self) -> String {
        format!("{}/ai/ask", self.base_url)
    }
}

impl Default for HttpGenerationBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GenerationBackend for HttpGenerationBackend {
    async fn generate(
        &self,
        request: &GenerationRequest,
        token: &AccessToken,
    ) -> std::result::Result<String, BackendError> {
        let payload = ask_payload(request);
        let res = self
            .client
            .post(self.ask_url())
            .bearer_auth(token.secret())
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(BackendError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let body: AskResponse = res.json().await.map_err(transport_error)?;
        body.answer
            .ok_or_else(|| BackendError::InvalidResponse("response has no answer field".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::RequestPurpose;

    #[test]
    fn test_single_item_payload() {
        let request =
            GenerationRequest::new(RequestPurpose::Diagnostic, "Why?", vec!["123".to_string()]);
        let payload = serde_json::to_value(ask_payload(&request)).unwrap();
        assert_eq!(
            payload,
            serde_json::json!({
                "mode": "single_item_qa",
                "prompt": "Why?",
                "items": [{"id": "123", "type": "file"}]
            })
        );
    }

    #[test]
    fn test_multi_item_payload() {
        let request = GenerationRequest::new(
            RequestPurpose::Generation,
            "Improve",
            vec!["1".to_string(), "2".to_string()],
        );
        let payload = serde_json::to_value(ask_payload(&request)).unwrap();
        assert_eq!(payload["mode"], "multiple_item_qa");
        assert_eq!(payload["items"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_base_url_is_normalized() {
        let backend = HttpGenerationBackend::with_base_url("https://example.test/2.0/");
        assert_eq!(backend.ask_url(), "https://example.test/2.0/ai/ask");
    }

    #[test]
    fn test_answer_parsing() {
        let body: AskResponse =
            serde_json::from_str(r#"{"answer": "{\"newPrompt\": \"x\"}", "created_at": "2024"}"#)
                .unwrap();
        assert_eq!(body.answer.as_deref(), Some("{\"newPrompt\": \"x\"}"));
    }
}

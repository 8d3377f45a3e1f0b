//! Language-model collaborator.
//!
//! The worker hands the question over verbatim and stores whatever comes
//! back. [`HttpLanguageModel`] speaks the OpenAI-compatible chat-completions
//! API; its timeout is the only bound on a slow answer.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ModelSettings;
use crate::utils::error::ModelError;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn answer(&self, question: &str) -> Result<String, ModelError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl ChatResponse {
    fn into_answer(self) -> Result<String, ModelError> {
        self.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(ModelError::EmptyAnswer)
    }
}

pub struct HttpLanguageModel {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

impl HttpLanguageModel {
    pub fn new(settings: &ModelSettings) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| ModelError::Request(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!(
                "{}/chat/completions",
                settings.base_url.trim_end_matches('/')
            ),
            model: settings.model.clone(),
            api_key: settings.api_key.clone(),
        })
    }
}

#[async_trait]
impl LanguageModel for HttpLanguageModel {
    async fn answer(&self, question: &str) -> Result<String, ModelError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: question,
            }],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ModelError::Request(e.to_string()))?;

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| ModelError::Request(e.to_string()))?;
        body.into_answer()
    }
}

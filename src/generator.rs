use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const SYSTEM_PROMPT: &str = "You are a helpful assistant that generates witty Instagram captions.";
const MAX_TOKENS: u32 = 60;

#[async_trait]
pub trait CaptionGenerator: Send + Sync {
    /// Produce `count` independent captions for an image described by `description`.
    async fn generate(&self, description: &str, count: usize) -> anyhow::Result<Vec<String>>;
}

pub fn caption_prompt(description: &str) -> String {
    format!(
        "Generate a witty and engaging Instagram caption for an image described as: {}",
        description
    )
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiGenerator {
    pub fn new(base_url: &str, api_key: Option<String>, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: model.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    n: usize,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl CaptionGenerator for OpenAiGenerator {
    async fn generate(&self, description: &str, count: usize) -> anyhow::Result<Vec<String>> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(anyhow!("OPENAI_API_KEY is not set"))?;

        let prompt = caption_prompt(description);
        let payload = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            max_tokens: MAX_TOKENS,
            n: count,
        };

        tracing::debug!("requesting {} captions for {:?}", count, description);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await
            .context("chat completion request failed")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("failed to read chat completion response")?;

        if !status.is_success() {
            return Err(anyhow!(
                "chat completion API error {}: {}",
                status,
                body.chars().take(500).collect::<String>()
            ));
        }

        let parsed: ChatResponse =
            serde_json::from_str(&body).context("malformed chat completion response")?;
        collect_captions(parsed, count)
    }
}

fn collect_captions(response: ChatResponse, count: usize) -> anyhow::Result<Vec<String>> {
    let captions: Vec<String> = response
        .choices
        .into_iter()
        .take(count)
        .map(|choice| choice.message.content.unwrap_or_default().trim().to_string())
        .collect();

    if captions.len() < count {
        return Err(anyhow!(
            "malformed response: expected {} captions, got {}",
            count,
            captions.len()
        ));
    }
    if captions.iter().any(String::is_empty) {
        return Err(anyhow!("malformed response: empty caption"));
    }
    Ok(captions)
}

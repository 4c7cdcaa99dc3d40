//! Vision-language description collaborator.

use crate::config::DescriberConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Prompt used when the configuration has no entry for the requested id.
const FALLBACK_PROMPT: &str = "Assess the health of the tree or bush in this image. \
Answer with a single JSON object. Include a `data_quality` object whose \
`overall_confidence` field is a number from 0 to 100 describing how confident \
you are that the image shows enough of the plant to judge its condition.";

/// Image handed to the describer.
#[derive(Debug, Clone, Copy)]
pub enum ImageInput<'a> {
    /// Encoded image bytes.
    Bytes {
        /// Encoded data.
        data: &'a [u8],
        /// MIME type of `data`.
        content_type: &'a str,
    },
    /// URL the describer can fetch itself.
    Url(&'a str),
}

impl ImageInput<'_> {
    /// URL form accepted by chat-completions APIs.
    ///
    /// Bytes become a base64 `data:` URL.
    pub fn to_url(&self) -> String {
        match self {
            Self::Bytes { data, content_type } => {
                format!("data:{content_type};base64,{}", STANDARD.encode(data))
            }
            Self::Url(url) => (*url).to_string(),
        }
    }
}

/// Produces a structured text description of an image.
#[async_trait]
pub trait Describer: Send + Sync {
    /// Describe `image` using the prompt registered under `prompt_id`.
    ///
    /// The returned text is opaque to the pipeline.
    async fn describe(&self, image: ImageInput<'_>, prompt_id: &str) -> Result<String>;
}

/// Describer backed by an OpenAI-compatible chat-completions endpoint.
#[derive(Clone)]
pub struct ChatDescriber {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
    temperature: f32,
    prompts: HashMap<String, String>,
}

impl std::fmt::Debug for ChatDescriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatDescriber")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl ChatDescriber {
    /// Create a describer from configuration.
    ///
    /// The API key is read from the environment variable named by
    /// `config.api_key_env`; a missing key sends unauthenticated requests.
    pub fn from_config(config: &DescriberConfig, client: Client) -> Self {
        let api_key = std::env::var(&config.api_key_env).ok();
        if api_key.is_none() {
            warn!(
                "{} is not set, describer requests will be unauthenticated",
                config.api_key_env
            );
        }

        Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            prompts: config.prompts.clone(),
        }
    }

    fn prompt(&self, prompt_id: &str) -> &str {
        self.prompts
            .get(prompt_id)
            .map_or(FALLBACK_PROMPT, String::as_str)
    }

    fn request<'a>(&'a self, image: &ImageInput<'_>, prompt_id: &str) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: vec![
                    ContentPart::Text {
                        text: self.prompt(prompt_id).to_string(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: image.to_url(),
                        },
                    },
                ],
            }],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream: false,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

fn first_content(response: ChatResponse) -> Result<String> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| Error::Description {
            reason: "response has no message content".to_string(),
        })
}

#[async_trait]
impl Describer for ChatDescriber {
    async fn describe(&self, image: ImageInput<'_>, prompt_id: &str) -> Result<String> {
        let body = self.request(&image, prompt_id);

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|source| Error::Http {
            url: self.endpoint.clone(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                url: self.endpoint.clone(),
                status: status.as_u16(),
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| Error::Description {
            reason: format!("invalid chat response: {e}"),
        })?;
        let text = first_content(parsed)?;
        debug!(prompt_id, chars = text.len(), "description received");
        Ok(text)
    }
}

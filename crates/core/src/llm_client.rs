use crate::error::BackendError;
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, CreateChatCompletionResponse, ResponseFormat,
    },
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The author of a single message in a model context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A role/content pair fed verbatim to the language model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling parameters shared by every request of one batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Number of samples requested per context.
    pub sample_count: u8,
    /// Ask the backend for a JSON object response.
    pub json_mode: bool,
}

impl GenerationParams {
    pub fn new(temperature: f32, max_tokens: u32) -> Self {
        Self {
            temperature,
            max_tokens,
            sample_count: 1,
            json_mode: false,
        }
    }

    pub fn with_samples(mut self, sample_count: u8) -> Self {
        self.sample_count = sample_count.max(1);
        self
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }
}

/// A single request against a text-generation backend.
///
/// Implementations return one string per returned choice and report every
/// failure as an error; retrying is the caller's job.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        params: GenerationParams,
    ) -> Result<Vec<String>, BackendError>;

    /// The model identifier recorded in call logs.
    fn model_name(&self) -> String;
}

/// A batched, fail-open client for a language model.
///
/// `generate` returns exactly one entry per input context, in input order,
/// and each entry holds exactly `params.sample_count` samples. A request that
/// could not be served yields empty strings instead of an error.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LanguageModelClient: Send + Sync {
    async fn generate(
        &self,
        batch: Vec<Vec<ChatMessage>>,
        params: GenerationParams,
    ) -> Vec<Vec<String>>;
}

/// An implementation of `CompletionBackend` for any OpenAI-compatible API.
pub struct OpenAICompatibleBackend {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAICompatibleBackend {
    /// Creates a new backend for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration for the OpenAI client, including API key and base URL.
    /// * `model` - The model identifier to use for chat completions (e.g., "gpt-4o-mini").
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }

    fn to_request_message(
        message: &ChatMessage,
    ) -> Result<ChatCompletionRequestMessage, BackendError> {
        let content = message.content.clone();
        Ok(match message.role {
            ChatRole::System => ChatCompletionRequestSystemMessageArgs::default()
                .content(content)
                .build()?
                .into(),
            ChatRole::User => ChatCompletionRequestUserMessageArgs::default()
                .content(content)
                .build()?
                .into(),
            ChatRole::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                .content(content)
                .build()?
                .into(),
        })
    }
}

#[async_trait]
impl CompletionBackend for OpenAICompatibleBackend {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        params: GenerationParams,
    ) -> Result<Vec<String>, BackendError> {
        let messages = messages
            .iter()
            .map(Self::to_request_message)
            .collect::<Result<Vec<_>, _>>()?;

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model)
            .messages(messages)
            .temperature(params.temperature)
            .max_completion_tokens(params.max_tokens)
            .top_p(1.0)
            .n(params.sample_count);
        if params.json_mode {
            args.response_format(ResponseFormat::JsonObject);
        }
        let request = args.build()?;

        let response: CreateChatCompletionResponse = self.client.chat().create(request).await?;
        if response.choices.is_empty() {
            return Err(BackendError::EmptyResponse);
        }

        Ok(response
            .choices
            .into_iter()
            .map(|choice| choice.message.content.unwrap_or_default())
            .collect())
    }

    fn model_name(&self) -> String {
        self.model.clone()
    }
}

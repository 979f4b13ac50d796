//! Per-request options for the router entry points.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use modelmux_core::types::GenerateOptions;

/// Adapter options plus the router-level controls for one logical request.
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    /// Passed through to the adapter on every attempt.
    pub generate: GenerateOptions,
    /// Bounds the whole candidate-and-retry sequence.
    pub deadline: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    /// When set, the exchange is recorded in the history store.
    pub conversation_id: Option<String>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.generate.max_tokens = Some(max_tokens);
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.generate.temperature = Some(temperature);
        self
    }

    pub fn model_override(mut self, model: impl Into<String>) -> Self {
        self.generate.model_override = Some(model.into());
        self
    }

    pub fn stop(mut self, stop: Vec<String>) -> Self {
        self.generate.stop = Some(stop);
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

impl From<GenerateOptions> for RequestOptions {
    fn from(generate: GenerateOptions) -> Self {
        Self {
            generate,
            ..Default::default()
        }
    }
}

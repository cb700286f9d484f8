//! Deterministic provider stub for tests and local development.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{Provider, ProviderError, ProviderReply};
use crate::dispatcher::InferenceRequest;

/// A provider that sleeps for a fixed delay and echoes the prompt.
///
/// Honours cancellation during the sleep, which makes it suitable for
/// exercising deadline and disconnect paths.
#[derive(Debug, Clone)]
pub struct StubProvider {
    delay: Duration,
}

impl StubProvider {
    /// Creates a stub that responds after `delay`.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Provider for StubProvider {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn complete(
        &self,
        request: &InferenceRequest,
        cancel: &CancellationToken,
    ) -> Result<ProviderReply, ProviderError> {
        tokio::select! {
            () = tokio::time::sleep(self.delay) => Ok(ProviderReply {
                text: format!("stub response for: {}", request.prompt),
                provider: "stub".to_string(),
                token_usage: 123,
            }),
            () = cancel.cancelled() => Err(ProviderError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stub_echoes_prompt() {
        let stub = StubProvider::new(Duration::from_millis(1));
        let request = InferenceRequest {
            prompt: "ping".to_string(),
            model: "stub".to_string(),
        };

        let reply = stub
            .complete(&request, &CancellationToken::new())
            .await
            .expect("stub succeeds");
        assert_eq!(reply.text, "stub response for: ping");
        assert_eq!(reply.provider, "stub");
    }

    #[tokio::test]
    async fn test_stub_honours_cancellation() {
        let stub = StubProvider::new(Duration::from_secs(5));
        let request = InferenceRequest {
            prompt: "never".to_string(),
            model: "stub".to_string(),
        };

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = stub.complete(&request, &cancel).await;
        assert!(matches!(result, Err(ProviderError::Cancelled)));
    }
}

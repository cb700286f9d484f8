//! Provider adapters for upstream LLM APIs.
//!
//! A provider is a stateless callable: given a prompt, a model and a
//! cancellation scope, it returns text plus token usage or an error. The
//! dispatcher treats providers as opaque; swapping a real provider for the
//! stub is how the dispatcher and HTTP surface are tested.

mod openrouter;
mod stub;

pub use openrouter::OpenRouterProvider;
pub use stub::StubProvider;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::InferenceRequest;

/// A successful provider completion.
#[derive(Debug, Clone)]
pub struct ProviderReply {
    /// Completion text.
    pub text: String,
    /// Which provider produced the reply.
    pub provider: String,
    /// Total tokens reported by the provider, zero when not tracked.
    pub token_usage: u32,
}

/// Errors a provider call can surface.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// The request's cancellation scope ended before the call finished.
    #[error("request cancelled")]
    Cancelled,

    /// The upstream provider returned an error or an unusable body.
    #[error("{provider}: {message}")]
    Upstream {
        /// Which provider failed.
        provider: String,
        /// Provider-reported or transport-level failure description.
        message: String,
    },
}

impl ProviderError {
    /// The provider label to use in metrics and logs for this error.
    #[must_use]
    pub fn provider(&self) -> &str {
        match self {
            Self::Cancelled => "unknown",
            Self::Upstream { provider, .. } => provider,
        }
    }
}

/// A stateless upstream completion adapter.
///
/// Implementations must honour the cancellation scope: a cancelled token
/// aborts the in-flight call and surfaces [`ProviderError::Cancelled`].
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable provider label used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Executes one completion under the given cancellation scope.
    ///
    /// # Errors
    ///
    /// [`ProviderError::Cancelled`] when the scope ends first, otherwise
    /// [`ProviderError::Upstream`] describing the provider failure.
    async fn complete(
        &self,
        request: &InferenceRequest,
        cancel: &CancellationToken,
    ) -> Result<ProviderReply, ProviderError>;
}

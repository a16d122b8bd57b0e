//! ModelClient trait definition

use async_trait::async_trait;

use super::{
    ChatRequest, EmbeddingBatch, GeneratedImages, ImageRequest, ModelError, ModelTurn, Transcription,
    TranscribeRequest,
};

/// Uniform interface to model endpoints.
///
/// `run` is the chat-completion turn every phase body uses; the other
/// operations have default `Unsupported` implementations so stub clients
/// only implement what a test needs.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Execute one chat-completion turn
    async fn run(&self, request: ChatRequest) -> Result<ModelTurn, ModelError>;

    /// Generate embedding vectors for a batch of texts
    async fn embed(&self, _texts: &[String], _model: Option<&str>) -> Result<EmbeddingBatch, ModelError> {
        Err(ModelError::Unsupported("embed"))
    }

    /// Transcribe audio to text
    async fn transcribe(&self, _request: TranscribeRequest) -> Result<Transcription, ModelError> {
        Err(ModelError::Unsupported("transcribe"))
    }

    /// Generate images from a prompt
    async fn generate_image(&self, _request: ImageRequest) -> Result<GeneratedImages, ModelError> {
        Err(ModelError::Unsupported("generate_image"))
    }
}

/// Deterministic stand-in clients for tests and offline runs
pub mod mock {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tracing::debug;

    use super::*;

    type Handler = Box<dyn Fn(&ChatRequest) -> Result<ModelTurn, ModelError> + Send + Sync>;

    /// Mock model client.
    ///
    /// Two modes: a scripted queue of turns consumed in order, or a handler
    /// closure deciding the turn from the request. Every request is captured
    /// for assertions.
    pub struct MockModelClient {
        responses: Mutex<VecDeque<ModelTurn>>,
        handler: Option<Handler>,
        call_count: AtomicUsize,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl MockModelClient {
        pub fn new(responses: Vec<ModelTurn>) -> Self {
            debug!(response_count = responses.len(), "MockModelClient::new");
            Self {
                responses: Mutex::new(responses.into()),
                handler: None,
                call_count: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }
        }

        /// Build a mock that computes each turn from the incoming request
        pub fn with_handler(
            handler: impl Fn(&ChatRequest) -> Result<ModelTurn, ModelError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                responses: Mutex::new(VecDeque::new()),
                handler: Some(Box::new(handler)),
                call_count: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }

        /// Requests seen so far, in call order
        pub fn requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }
    }

    #[async_trait]
    impl ModelClient for MockModelClient {
        async fn run(&self, request: ChatRequest) -> Result<ModelTurn, ModelError> {
            debug!(model = %request.model_spec, "MockModelClient::run");
            self.call_count.fetch_add(1, Ordering::SeqCst);
            self.requests
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(request.clone());

            if let Some(handler) = &self.handler {
                return handler(&request);
            }

            self.responses
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
                .ok_or_else(|| ModelError::InvalidResponse("No more mock responses".to_string()))
        }

        async fn embed(&self, texts: &[String], model: Option<&str>) -> Result<EmbeddingBatch, ModelError> {
            // Trivial deterministic vectors keep offline tests self-contained
            let embeddings = texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect();
            Ok(EmbeddingBatch {
                embeddings,
                model: model.unwrap_or("stub-embed").to_string(),
                dim: 2,
                request_id: None,
                tokens: 0,
                provider: "stub".to_string(),
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_mock_returns_scripted_responses() {
            let client = MockModelClient::new(vec![ModelTurn::text("one"), ModelTurn::text("two")]);
            let request = ChatRequest::new("stub/model", "system");

            let first = client.run(request.clone()).await.unwrap();
            assert_eq!(first.content, "one");
            let second = client.run(request.clone()).await.unwrap();
            assert_eq!(second.content, "two");
            assert_eq!(client.call_count(), 2);
        }

        #[tokio::test]
        async fn test_mock_errors_when_exhausted() {
            let client = MockModelClient::new(vec![]);
            let result = client.run(ChatRequest::new("stub/model", "")).await;
            assert!(result.is_err());
        }

        #[tokio::test]
        async fn test_handler_sees_request() {
            let client = MockModelClient::with_handler(|request| {
                Ok(ModelTurn::text(format!("echo {}", request.user.as_deref().unwrap_or(""))))
            });
            let turn = client
                .run(ChatRequest::new("stub/model", "").with_user("hello"))
                .await
                .unwrap();
            assert_eq!(turn.content, "echo hello");
            assert_eq!(client.requests().len(), 1);
        }
    }
}

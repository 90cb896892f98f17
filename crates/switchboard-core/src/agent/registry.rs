use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::envelope::{RequestEnvelope, RequestType, ResponseEnvelope};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Invalid details for {request_type}: {message}")]
    InvalidDetails {
        request_type: String,
        message: String,
    },

    #[error("Handler failed: {message}")]
    Failed { message: String },
}

impl HandlerError {
    pub fn invalid_details(request_type: &RequestType, message: impl Into<String>) -> Self {
        Self::InvalidDetails {
            request_type: request_type.to_string(),
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// What a handler decided. The runtime publishes `response` and, when
/// `escalation` is set, exactly one supervisor notification carrying it.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutcome {
    pub response: ResponseEnvelope,
    pub escalation: Option<String>,
}

impl HandlerOutcome {
    pub fn respond(response: ResponseEnvelope) -> Self {
        Self {
            response,
            escalation: None,
        }
    }

    pub fn escalate(response: ResponseEnvelope, reason: impl Into<String>) -> Self {
        Self {
            response,
            escalation: Some(reason.into()),
        }
    }
}

impl From<ResponseEnvelope> for HandlerOutcome {
    fn from(response: ResponseEnvelope) -> Self {
        Self::respond(response)
    }
}

#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: &RequestEnvelope) -> Result<HandlerOutcome, HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> RequestHandler for FnHandler<F>
where
    F: Fn(&RequestEnvelope) -> Result<HandlerOutcome, HandlerError> + Send + Sync,
{
    async fn handle(&self, request: &RequestEnvelope) -> Result<HandlerOutcome, HandlerError> {
        (self.0)(request)
    }
}

/// Request-type tag to handler. One registry per agent kind.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<RequestType, Arc<dyn RequestHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        request_type: impl Into<RequestType>,
        handler: impl RequestHandler + 'static,
    ) -> &mut Self {
        self.handlers
            .insert(request_type.into(), Arc::new(handler));
        self
    }

    /// Registers a synchronous closure.
    pub fn register_fn<F>(&mut self, request_type: impl Into<RequestType>, handler: F) -> &mut Self
    where
        F: Fn(&RequestEnvelope) -> Result<HandlerOutcome, HandlerError> + Send + Sync + 'static,
    {
        self.register(request_type, FnHandler(handler))
    }

    pub fn handler(&self, request_type: &RequestType) -> Option<Arc<dyn RequestHandler>> {
        self.handlers.get(request_type).cloned()
    }

    pub fn is_registered(&self, request_type: &RequestType) -> bool {
        self.handlers.contains_key(request_type)
    }

    pub fn request_types(&self) -> Vec<&RequestType> {
        let mut types: Vec<_> = self.handlers.keys().collect();
        types.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

//! Callbacks invoked by the consume loop.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{HandlerError, StreamError};

/// Receives messages from a consumer group.
///
/// A message is marked consumed only after `on_message` returns `Ok`; an
/// error leaves the cursor in place so the message is delivered again.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one message payload.
    async fn on_message(&self, message: &[u8]) -> Result<(), HandlerError>;

    /// Notification of a non-fatal error. The consume loop keeps running.
    fn on_error(&self, error: &StreamError);
}

#[async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    async fn on_message(&self, message: &[u8]) -> Result<(), HandlerError> {
        (**self).on_message(message).await
    }

    fn on_error(&self, error: &StreamError) {
        (**self).on_error(error);
    }
}

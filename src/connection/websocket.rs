//! WebSocket push transport.

use super::{MessageStream, PushTransport};
use crate::domain::{TransportError, WorkflowId};
use async_trait::async_trait;
use futures::StreamExt;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

/// Connects to `events_url` with `{id}` replaced by the workflow id.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url_template: String,
}

impl WebSocketTransport {
    pub fn new(url_template: impl Into<String>) -> Self {
        Self {
            url_template: url_template.into(),
        }
    }

    pub fn url_for(&self, workflow_id: &WorkflowId) -> String {
        self.url_template.replace("{id}", workflow_id.as_str())
    }
}

#[async_trait]
impl PushTransport for WebSocketTransport {
    async fn connect(&self, workflow_id: &WorkflowId) -> Result<MessageStream, TransportError> {
        let url = self.url_for(workflow_id);
        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Refused(format!("{}: {}", url, e)))?;

        // Ping/pong is answered by tungstenite while the stream is read.
        let messages = ws.filter_map(|message| async move { frame_text(message) });

        Ok(messages.boxed())
    }
}

/// Maps one frame to a message, a channel error, or nothing. A binary frame
/// that is not UTF-8 is skipped without dropping the channel.
fn frame_text(message: Result<WsMessage, WsError>) -> Option<Result<String, TransportError>> {
    match message {
        Ok(WsMessage::Text(text)) => Some(Ok(text)),
        Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes) {
            Ok(text) => Some(Ok(text)),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping non-UTF-8 binary frame");
                None
            }
        },
        Ok(WsMessage::Close(_)) => Some(Err(TransportError::Closed)),
        Ok(_) => None,
        Err(e) => Some(Err(TransportError::Protocol(e.to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_template_substitutes_id() {
        let transport = WebSocketTransport::new("ws://localhost:8000/ws/workflows/{id}");
        assert_eq!(
            transport.url_for(&WorkflowId::from("wf_1")),
            "ws://localhost:8000/ws/workflows/wf_1"
        );
    }

    #[test]
    fn test_invalid_utf8_binary_frame_is_skipped() {
        let frame = Ok(WsMessage::Binary(vec![0xff, 0xfe, 0x00]));
        assert_eq!(frame_text(frame), None);
    }

    #[test]
    fn test_text_and_utf8_binary_frames_are_forwarded() {
        assert_eq!(
            frame_text(Ok(WsMessage::Text("{\"type\":\"ping\"}".to_string()))),
            Some(Ok("{\"type\":\"ping\"}".to_string()))
        );
        assert_eq!(
            frame_text(Ok(WsMessage::Binary(b"hello".to_vec()))),
            Some(Ok("hello".to_string()))
        );
    }

    #[test]
    fn test_close_and_read_errors_end_the_channel() {
        assert_eq!(
            frame_text(Ok(WsMessage::Close(None))),
            Some(Err(TransportError::Closed))
        );
        assert!(matches!(
            frame_text(Err(WsError::ConnectionClosed)),
            Some(Err(TransportError::Protocol(_)))
        ));
        assert_eq!(frame_text(Ok(WsMessage::Ping(vec![1]))), None);
    }
}

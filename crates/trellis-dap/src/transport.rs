//! DAP transport layer: Content-Length based message framing.

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::DapError;
use crate::protocol::ProtocolMessage;

/// Largest message body accepted from an adapter.
pub const MAX_CONTENT_LENGTH: usize = 64 * 1024 * 1024;

/// Encode a message into DAP wire format with a Content-Length header.
pub fn encode_message<T: Serialize>(value: &T) -> Result<Vec<u8>, DapError> {
    let body = serde_json::to_string(value)?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    let mut buf = Vec::with_capacity(header.len() + body.len());
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(body.as_bytes());
    Ok(buf)
}

/// Parse the Content-Length value from a header line.
///
/// Returns `Ok(None)` for other header fields.
fn parse_content_length(line: &str) -> Result<Option<usize>, DapError> {
    match line.trim().strip_prefix("Content-Length:") {
        Some(value) => {
            let value = value.trim();
            value.parse::<usize>().map(Some).map_err(|e| {
                DapError::InvalidResponse(format!("invalid Content-Length value '{value}': {e}"))
            })
        }
        None => Ok(None),
    }
}

/// Read one framed message.
///
/// Returns `Ok(None)` on a clean end of stream between messages.
/// [`DapError::InvalidResponse`] means the frame was consumed but could not
/// be understood and reading may continue; [`DapError::Transport`] means the
/// stream is unusable.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<ProtocolMessage>, DapError>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            if saw_header {
                return Err(DapError::Transport("stream ended inside a header".into()));
            }
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if saw_header {
                break;
            }
            continue;
        }
        saw_header = true;
        if let Some(length) = parse_content_length(trimmed)? {
            content_length = Some(length);
        }
    }

    let length = content_length
        .ok_or_else(|| DapError::InvalidResponse("missing Content-Length header".into()))?;
    // The body cannot be skipped without reading it, so the stream is lost
    if length > MAX_CONTENT_LENGTH {
        return Err(DapError::Transport(format!(
            "Content-Length {length} exceeds the {MAX_CONTENT_LENGTH} byte limit"
        )));
    }

    let mut body = vec![0u8; length];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| DapError::Transport(format!("incomplete body: {e}")))?;

    let message = serde_json::from_slice::<ProtocolMessage>(&body)
        .map_err(|e| DapError::InvalidResponse(format!("JSON parse error: {e}")))?;
    Ok(Some(message))
}

/// Write one framed message and flush it.
pub async fn write_message<W>(writer: &mut W, message: &ProtocolMessage) -> Result<(), DapError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_message(message)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

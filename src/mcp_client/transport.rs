//! JSON-RPC over line-delimited stdio transport.
//!
//! One JSON object per line in both directions. A request holds the
//! exchange lock until its matching response arrives, so concurrent callers
//! never consume each other's responses. Non-JSON lines (server log output)
//! and responses for other ids are skipped.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

// ─── Request ID Generator ────────────────────────────────────────────────────

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Transport ───────────────────────────────────────────────────────────────

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;

/// Bi-directional JSON-RPC transport over a pair of byte streams.
pub struct LineTransport {
    server_name: String,
    io: Mutex<(BoxedWriter, BoxedReader)>,
}

impl LineTransport {
    /// Create a transport writing requests to `writer` and reading responses
    /// from `reader` (a child's stdin/stdout, or an in-memory pipe in tests).
    pub fn new<W, R>(server_name: &str, writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let writer: BoxedWriter = Box::new(writer);
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        Self {
            server_name: server_name.to_string(),
            io: Mutex::new((writer, BufReader::new(reader))),
        }
    }

    /// Send a JSON-RPC request and wait for the response with the same id.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let line = self.encode(&JsonRpcRequest::new(id, method, params))?;

        let mut io = self.io.lock().await;
        let (writer, reader) = &mut *io;
        self.write_line(writer, &line).await?;

        let mut line_buf = String::new();
        loop {
            line_buf.clear();
            let bytes_read = reader
                .read_line(&mut line_buf)
                .await
                .map_err(|e| self.transport_error(format!("failed to read from stdout: {e}")))?;

            if bytes_read == 0 {
                return Err(self.transport_error(
                    "source stdout closed (process may have exited)".into(),
                ));
            }

            let trimmed = line_buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(resp) if resp.id == id => return Ok(resp),
                Ok(resp) => {
                    tracing::debug!(
                        server = %self.server_name,
                        expected = id,
                        got = resp.id,
                        "skipping response for another request"
                    );
                }
                Err(_) => {
                    tracing::debug!(
                        server = %self.server_name,
                        line = %crate::agent_core::tokens::truncate_utf8(trimmed, 200),
                        "skipping non-response line"
                    );
                }
            }
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let line = self.encode(&JsonRpcNotification {
            jsonrpc: "2.0".into(),
            method: method.to_string(),
            params,
        })?;
        let mut io = self.io.lock().await;
        self.write_line(&mut io.0, &line).await
    }

    fn encode<T: serde::Serialize>(&self, message: &T) -> Result<String, McpError> {
        let mut json = serde_json::to_string(message)
            .map_err(|e| self.transport_error(format!("failed to serialize message: {e}")))?;
        json.push('\n');
        Ok(json)
    }

    async fn write_line(&self, writer: &mut BoxedWriter, line: &str) -> Result<(), McpError> {
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("failed to flush stdin: {e}")))
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason,
        }
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: super::types::error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

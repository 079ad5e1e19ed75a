//! Signer client.
//!
//! The agent-process side of the signer protocol: a dumb forwarder of
//! request/approval-token pairs. It never loads or derives key material.
//! Connections are one-shot with a configurable timeout.

use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::error::{WardexError, WardexResult};
use crate::signer::protocol::{SignerRequest, SignerResponse};

/// Default connect/request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Client handle for the isolated signer socket.
#[derive(Debug, Clone)]
pub struct SignerClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl SignerClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send one request and await its response.
    pub async fn request(&self, request: &SignerRequest) -> WardexResult<SignerResponse> {
        let attempt = self.round_trip(request);
        tokio::time::timeout(self.timeout, attempt)
            .await
            .map_err(|_| WardexError::SignerTimeout(self.timeout.as_secs()))?
    }

    async fn round_trip(&self, request: &SignerRequest) -> WardexResult<SignerResponse> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound
                || e.kind() == std::io::ErrorKind::ConnectionRefused
            {
                WardexError::Signer("signer is not running".to_string())
            } else {
                WardexError::Signer(format!("failed to connect: {e}"))
            }
        })?;

        let (reader, mut writer) = stream.into_split();
        let json = serde_json::to_string(request)?;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        if line.is_empty() {
            return Err(WardexError::Signer(
                "signer closed the connection without responding".to_string(),
            ));
        }
        Ok(serde_json::from_str(&line)?)
    }

    /// Probe the signer. Returns true when it answers a health check.
    pub async fn health_check(&self) -> bool {
        matches!(
            self.request(&SignerRequest::HealthCheck).await,
            Ok(response) if response.success
        )
    }

    /// Fetch the signer's address.
    pub async fn get_address(&self) -> WardexResult<String> {
        let response = self.request(&SignerRequest::GetAddress).await?;
        extract_field(response, "address")
    }

    /// Forward a signing request. The approval token must have been minted
    /// by the shield for exactly this transaction hash.
    pub async fn sign_transaction(
        &self,
        transaction_hash: &str,
        serialized_tx: &str,
        approval_token: &str,
    ) -> WardexResult<String> {
        let response = self
            .request(&SignerRequest::SignTransaction {
                transaction_hash: transaction_hash.to_string(),
                serialized_tx: serialized_tx.to_string(),
                approval_token: approval_token.to_string(),
            })
            .await?;
        extract_field(response, "signature")
    }

    /// Forward a message-signing request.
    pub async fn sign_message(&self, message: &str, approval_token: &str) -> WardexResult<String> {
        let response = self
            .request(&SignerRequest::SignMessage {
                message: message.to_string(),
                approval_token: approval_token.to_string(),
            })
            .await?;
        extract_field(response, "signature")
    }
}

fn extract_field(response: SignerResponse, field: &str) -> WardexResult<String> {
    if !response.success {
        return Err(WardexError::Signer(
            response.error.unwrap_or_else(|| "unknown signer error".to_string()),
        ));
    }
    response
        .data
        .as_ref()
        .and_then(|d| d.get(field))
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| WardexError::Signer(format!("signer response missing {field:?}")))
}

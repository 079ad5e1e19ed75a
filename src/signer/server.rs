//! Isolated signer process.
//!
//! The signer is the only process that ever sees plaintext key material. It
//! listens on a local Unix socket with 0o600 permissions, answers
//! newline-delimited JSON requests, and refuses to sign anything whose
//! approval token does not verify against the signable payload. The key is
//! decrypted at startup into a zeroizing buffer and wiped on shutdown.

use alloy_primitives::{keccak256, Address};
use k256::ecdsa::SigningKey;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use zeroize::Zeroizing;

use crate::error::{WardexError, WardexResult};
use crate::signer::keyfile::EncryptedKeyFile;
use crate::signer::protocol::{SignerRequest, SignerResponse};
use crate::token;

/// Shared signing state. `SigningKey` wipes its scalar on drop.
pub(crate) struct SignerCore {
    signing_key: SigningKey,
    address: Address,
    token_secret: Zeroizing<Vec<u8>>,
}

impl SignerCore {
    fn new(signing_key: SigningKey, token_secret: Vec<u8>) -> Self {
        let address = derive_address(&signing_key);
        Self {
            signing_key,
            address,
            token_secret: Zeroizing::new(token_secret),
        }
    }

    pub(crate) fn handle(&self, request: SignerRequest) -> SignerResponse {
        match request {
            SignerRequest::HealthCheck => SignerResponse::ok(serde_json::json!({
                "status": "ok",
                "version": env!("CARGO_PKG_VERSION"),
            })),

            SignerRequest::GetAddress => SignerResponse::ok(serde_json::json!({
                "address": self.address.to_string(),
            })),

            SignerRequest::SignTransaction {
                transaction_hash,
                serialized_tx: _,
                approval_token,
            } => {
                if !token::verify(
                    &approval_token,
                    &transaction_hash,
                    &self.token_secret,
                    token::now_ms(),
                ) {
                    return SignerResponse::err("approval token invalid or expired");
                }
                let digest = match parse_hash(&transaction_hash) {
                    Ok(digest) => digest,
                    Err(e) => return SignerResponse::err(format!("invalid transaction hash: {e}")),
                };
                self.sign_digest(&digest)
            }

            SignerRequest::SignMessage {
                message,
                approval_token,
            } => {
                if !token::verify(
                    &approval_token,
                    &message,
                    &self.token_secret,
                    token::now_ms(),
                ) {
                    return SignerResponse::err("approval token invalid or expired");
                }
                // EIP-191 personal message digest.
                let prefixed = format!("\x19Ethereum Signed Message:\n{}{}", message.len(), message);
                let digest = keccak256(prefixed.as_bytes());
                self.sign_digest(digest.as_slice())
            }
        }
    }

    fn sign_digest(&self, digest: &[u8]) -> SignerResponse {
        match self.signing_key.sign_prehash_recoverable(digest) {
            Ok((signature, recovery_id)) => {
                let mut bytes = [0u8; 65];
                bytes[..64].copy_from_slice(&signature.to_bytes());
                bytes[64] = 27 + recovery_id.to_byte();
                SignerResponse::ok(serde_json::json!({
                    "signature": format!("0x{}", hex::encode(bytes)),
                }))
            }
            Err(e) => SignerResponse::err(format!("signing operation failed: {e}")),
        }
    }
}

fn derive_address(signing_key: &SigningKey) -> Address {
    let encoded = signing_key.verifying_key().to_encoded_point(false);
    let digest = keccak256(&encoded.as_bytes()[1..]);
    Address::from_slice(&digest[12..])
}

fn parse_hash(hash: &str) -> Result<[u8; 32], String> {
    let stripped = hash.strip_prefix("0x").unwrap_or(hash);
    let mut digest = [0u8; 32];
    hex::decode_to_slice(stripped, &mut digest).map_err(|e| e.to_string())?;
    Ok(digest)
}

/// The signer daemon.
pub struct SignerServer {
    socket_path: PathBuf,
    core: Arc<SignerCore>,
}

impl SignerServer {
    /// Decrypt the key file and prepare the server. The intermediate
    /// plaintext buffer zeroizes on scope exit.
    pub fn new(
        socket_path: impl Into<PathBuf>,
        key_file: &EncryptedKeyFile,
        passphrase: &str,
        token_secret: Vec<u8>,
    ) -> WardexResult<Self> {
        let key_bytes = crate::signer::keyfile::decrypt_key(key_file, passphrase)?;
        let signing_key = SigningKey::from_bytes((&*key_bytes).into())
            .map_err(|e| WardexError::Crypto(format!("invalid signing key: {e}")))?;

        Ok(Self {
            socket_path: socket_path.into(),
            core: Arc::new(SignerCore::new(signing_key, token_secret)),
        })
    }

    /// The address the signer will sign for.
    pub fn address(&self) -> Address {
        self.core.address
    }

    /// Bind the socket and serve until the task is cancelled.
    pub async fn run(&self) -> WardexResult<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| WardexError::Signer(format!("failed to bind socket: {e}")))?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;

        tracing::info!(path = %self.socket_path.display(), "signer listening");

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let core = Arc::clone(&self.core);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, core).await {
                            tracing::error!(error = %e, "signer connection error");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "signer accept error");
                }
            }
        }
    }

    /// Remove the socket file. Called on orderly shutdown.
    pub fn cleanup(&self) -> WardexResult<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        Ok(())
    }
}

async fn handle_connection<S>(stream: S, core: Arc<SignerCore>) -> WardexResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<SignerRequest>(&line) {
            Ok(request) => {
                tracing::debug!(?request, "signer request");
                core.handle(request)
            }
            Err(e) => SignerResponse::err(format!("invalid request: {e}")),
        };

        let json = serde_json::to_string(&response)?;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        line.clear();
    }

    Ok(())
}

/// Convenience for operators: generate a fresh key and write its encrypted
/// file, returning the address it controls.
pub fn init_key_file(path: &Path, passphrase: &str) -> WardexResult<Address> {
    let signing_key = SigningKey::random(&mut rand::thread_rng());
    let address = derive_address(&signing_key);
    let key_bytes: Zeroizing<[u8; 32]> = Zeroizing::new(signing_key.to_bytes().into());
    let file = crate::signer::keyfile::encrypt_key(&key_bytes, passphrase)?;
    crate::signer::keyfile::save(path, &file)?;
    Ok(address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::keyfile;

    const SECRET: &[u8] = b"shield-signer-secret";
    const HASH: &str = "0x7c5ea36004851c764c44143b1dcb59679b11c9a68e5f41497f6cf3d480715331";

    fn make_core() -> SignerCore {
        let mut key = [0u8; 32];
        key[31] = 1;
        let signing_key = SigningKey::from_bytes((&key).into()).unwrap();
        SignerCore::new(signing_key, SECRET.to_vec())
    }

    #[test]
    fn test_health_check() {
        let core = make_core();
        let response = core.handle(SignerRequest::HealthCheck);
        assert!(response.success);
        assert_eq!(response.data.unwrap()["status"], "ok");
    }

    #[test]
    fn test_get_address_known_key() {
        // The address of private key 0x...01 is a fixed, well-known value.
        let core = make_core();
        let response = core.handle(SignerRequest::GetAddress);
        let address = response.data.unwrap()["address"].as_str().unwrap().to_string();
        assert_eq!(
            address.to_lowercase(),
            "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
    }

    #[test]
    fn test_sign_with_valid_token() {
        let core = make_core();
        let approval = token::generate(HASH, SECRET, token::now_ms()).unwrap();
        let response = core.handle(SignerRequest::SignTransaction {
            transaction_hash: HASH.to_string(),
            serialized_tx: "0x".to_string(),
            approval_token: approval,
        });

        assert!(response.success, "{:?}", response.error);
        let signature = response.data.unwrap()["signature"]
            .as_str()
            .unwrap()
            .to_string();
        // 0x + 65 bytes.
        assert_eq!(signature.len(), 132);
    }

    #[test]
    fn test_sign_rejects_bad_token() {
        let core = make_core();
        let response = core.handle(SignerRequest::SignTransaction {
            transaction_hash: HASH.to_string(),
            serialized_tx: "0x".to_string(),
            approval_token: "0".repeat(80),
        });
        assert!(!response.success);
        assert!(response.error.unwrap().contains("approval token"));
    }

    #[test]
    fn test_sign_rejects_token_for_other_hash() {
        let core = make_core();
        let approval = token::generate("0xother", SECRET, token::now_ms()).unwrap();
        let response = core.handle(SignerRequest::SignTransaction {
            transaction_hash: HASH.to_string(),
            serialized_tx: "0x".to_string(),
            approval_token: approval,
        });
        assert!(!response.success);
    }

    #[test]
    fn test_sign_rejects_expired_token() {
        let core = make_core();
        let stale = token::now_ms() - token::TOKEN_TTL_MS - 1;
        let approval = token::generate(HASH, SECRET, stale).unwrap();
        let response = core.handle(SignerRequest::SignTransaction {
            transaction_hash: HASH.to_string(),
            serialized_tx: "0x".to_string(),
            approval_token: approval,
        });
        assert!(!response.success);
    }

    #[test]
    fn test_sign_message_binds_token_to_message() {
        let core = make_core();
        let approval = token::generate("hello wardex", SECRET, token::now_ms()).unwrap();

        let response = core.handle(SignerRequest::SignMessage {
            message: "hello wardex".to_string(),
            approval_token: approval.clone(),
        });
        assert!(response.success);

        let response = core.handle(SignerRequest::SignMessage {
            message: "different message".to_string(),
            approval_token: approval,
        });
        assert!(!response.success);
    }

    #[test]
    fn test_server_construction_from_key_file() {
        let mut key = [0u8; 32];
        key[31] = 1;
        let file = keyfile::encrypt_key(&key, "pass").unwrap();
        let server = SignerServer::new("/tmp/unused.sock", &file, "pass", SECRET.to_vec()).unwrap();
        assert_eq!(
            server.address().to_string().to_lowercase(),
            "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
    }

    #[test]
    fn test_init_key_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.json");
        let address = init_key_file(&path, "pass").unwrap();

        let file = keyfile::load(&path).unwrap();
        let server = SignerServer::new("/tmp/unused.sock", &file, "pass", SECRET.to_vec()).unwrap();
        assert_eq!(server.address(), address);
    }
}

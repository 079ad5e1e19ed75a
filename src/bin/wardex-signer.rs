//! Wardex isolated signer daemon.
//!
//! Runs as a separate, longer-lived process: decrypts the key file with a
//! passphrase from the environment and serves signing requests over a local
//! socket, honoring only requests that carry a valid approval token.

use wardex::config::Config;
use wardex::signer::{keyfile, SignerServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    wardex::logging::init();

    tracing::info!("Starting Wardex signer v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load().map_err(|e| {
        tracing::error!(error = %e, "Failed to load configuration");
        anyhow::anyhow!("Configuration error: {e}")
    })?;

    let passphrase = std::env::var("WARDEX_SIGNER_PASSPHRASE")
        .map_err(|_| anyhow::anyhow!("WARDEX_SIGNER_PASSPHRASE is not set"))?;
    let token_secret = std::env::var("WARDEX_TOKEN_SECRET")
        .map_err(|_| anyhow::anyhow!("WARDEX_TOKEN_SECRET is not set"))?;

    let key_path = std::path::Path::new(&config.signer.key_file);
    let key_file = if key_path.exists() {
        keyfile::load(key_path)?
    } else {
        let address = wardex::signer::init_key_file(key_path, &passphrase)?;
        tracing::info!(address = %address, path = %key_path.display(), "generated new key file");
        keyfile::load(key_path)?
    };

    let server = SignerServer::new(
        &config.signer.socket_path,
        &key_file,
        &passphrase,
        token_secret.into_bytes(),
    )?;

    tracing::info!(
        address = %server.address(),
        socket = %config.signer.socket_path,
        "signer ready"
    );

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "signer server terminated");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    server.cleanup()?;
    tracing::info!("signer stopped; key material wiped");
    Ok(())
}

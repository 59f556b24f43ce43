//! Service credential cache.
//!
//! Holds the proxy's own upstream-facing credential: the CA bundle used to
//! verify the API server, the bearer token the proxy authenticates with, and
//! its namespace. The three files are mounted by the orchestrator and rotated
//! underneath us, so they are re-read on a fixed interval.
//!
//! The bundle is replaced wholesale: readers clone an `Arc` under a short read
//! lock and never see fields from two refresh cycles. Any read failure, at
//! startup or during refresh, is [`Error::Fatal`].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use reqwest::Certificate;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};

use crate::{Error, Result};

/// CA bundle file name inside the secret directory
pub const CA_FILE: &str = "ca.crt";
/// Bearer token file name inside the secret directory
pub const TOKEN_FILE: &str = "token";
/// Namespace file name inside the secret directory
pub const NAMESPACE_FILE: &str = "namespace";

/// One complete snapshot of the service credential.
#[derive(Debug, Clone)]
pub struct CredentialBundle {
    /// Trust anchors for the upstream TLS certificate
    pub root_certs: Vec<Certificate>,
    /// Bearer token presented to the upstream
    pub token: String,
    /// Namespace the proxy runs in
    pub namespace: String,
    /// Incremented on every successful load
    pub generation: u64,
}

/// Periodically refreshed holder of the current [`CredentialBundle`].
#[derive(Debug)]
pub struct CredentialCache {
    dir: PathBuf,
    current: RwLock<Arc<CredentialBundle>>,
}

impl CredentialCache {
    /// Read the credential files in `dir` once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fatal`] if any file is missing or the CA bundle holds
    /// no certificate.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let bundle = read_bundle(&dir, 1)?;
        info!(
            dir = %dir.display(),
            namespace = %bundle.namespace,
            certs = bundle.root_certs.len(),
            "Loaded service credentials"
        );
        Ok(Self {
            dir,
            current: RwLock::new(Arc::new(bundle)),
        })
    }

    /// Re-read the files and swap the bundle in one step.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fatal`] on any read failure. The previous bundle stays
    /// in place but the caller is expected to stop serving.
    pub fn refresh(&self) -> Result<()> {
        let next_generation = self.current.read().generation + 1;
        let bundle = Arc::new(read_bundle(&self.dir, next_generation)?);
        *self.current.write() = bundle;
        debug!(generation = next_generation, "Refreshed service credentials");
        Ok(())
    }

    /// The latest complete bundle.
    #[must_use]
    pub fn snapshot(&self) -> Arc<CredentialBundle> {
        Arc::clone(&self.current.read())
    }

    /// Current CA trust bundle
    #[must_use]
    pub fn root_certs(&self) -> Vec<Certificate> {
        self.snapshot().root_certs.clone()
    }

    /// Current service bearer token
    #[must_use]
    pub fn token(&self) -> String {
        self.snapshot().token.clone()
    }

    /// Current namespace
    #[must_use]
    pub fn namespace(&self) -> String {
        self.snapshot().namespace.clone()
    }
}

fn read_bundle(dir: &Path, generation: u64) -> Result<CredentialBundle> {
    let read = |name: &str| -> Result<Vec<u8>> {
        let path = dir.join(name);
        fs::read(&path).map_err(|e| Error::Fatal(format!("Failed to read {}: {e}", path.display())))
    };

    let ca = read(CA_FILE)?;
    let token = read(TOKEN_FILE)?;
    let namespace = read(NAMESPACE_FILE)?;

    let root_certs = Certificate::from_pem_bundle(&ca)
        .map_err(|e| Error::Fatal(format!("Invalid CA bundle: {e}")))?;
    if root_certs.is_empty() {
        return Err(Error::Fatal(format!(
            "No certificates in {}",
            dir.join(CA_FILE).display()
        )));
    }

    Ok(CredentialBundle {
        root_certs,
        token: String::from_utf8_lossy(&token).trim().to_string(),
        namespace: String::from_utf8_lossy(&namespace).trim().to_string(),
        generation,
    })
}

/// Spawn the periodic refresh task.
///
/// A failed refresh is sent on `fatal` and ends the task; the server treats
/// it as a reason to stop. The task also exits when `shutdown` fires.
pub fn spawn_refresh(
    cache: Arc<CredentialCache>,
    interval: Duration,
    fatal: mpsc::Sender<Error>,
    mut shutdown: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; the bundle was just loaded.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = cache.refresh() {
                        error!(error = %e, "Service credential refresh failed");
                        let _ = fatal.send(e).await;
                        break;
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Credential refresh shutting down");
                    break;
                }
            }
        }
    });
}

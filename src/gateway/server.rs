//! Proxy server

use std::net::SocketAddr;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use super::auth::Authenticator;
use super::proxy::UpstreamTransport;
use super::router::{AppState, create_router};
use crate::config::Config;
use crate::credentials::{self, CredentialCache};
use crate::oauth::{HttpIdentityProvider, IdentityProvider, OAuthFlow};
use crate::reconcile::{KubeUserDirectory, NoopDirectory, UserDirectory};
use crate::store;
use crate::tokens::TokenManager;
use crate::{Error, Result};

/// Authenticating proxy server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Service credential cache
    credentials: Arc<CredentialCache>,
    /// Router state
    state: AppState,
    /// Shutdown broadcast for background tasks
    shutdown_tx: broadcast::Sender<()>,
}

impl Gateway {
    /// Create a new gateway
    ///
    /// Loads the service credentials and opens the token store. Both are
    /// required: a missing credential file is [`Error::Fatal`].
    pub async fn new(config: Config) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);

        let credentials = Arc::new(CredentialCache::load(&config.credentials.secret_path)?);

        let store = store::open(&config.storage, shutdown_tx.subscribe()).await?;
        let tokens = Arc::new(TokenManager::new(store, config.tokens.clone()));

        let transport = Arc::new(UpstreamTransport::new(
            config.upstream.clone(),
            Arc::clone(&credentials),
        )?);

        let provider: Arc<dyn IdentityProvider> =
            Arc::new(HttpIdentityProvider::new(config.oauth.clone())?);

        let directory: Arc<dyn UserDirectory> = if config.reconcile.enabled {
            info!(resource = %config.reconcile.resource_path, "User reconciliation enabled");
            Arc::new(KubeUserDirectory::new(
                Arc::clone(&transport),
                config.reconcile.clone(),
            ))
        } else {
            Arc::new(NoopDirectory)
        };

        let oauth = Arc::new(OAuthFlow::new(
            Arc::clone(&provider),
            directory,
            config.oauth.clone(),
        ));
        let authenticator = Arc::new(Authenticator::new(
            Arc::clone(&tokens),
            provider,
            config.oauth.default_group.clone(),
        ));

        Ok(Self {
            config,
            credentials,
            state: AppState {
                authenticator,
                tokens,
                transport,
                oauth,
            },
            shutdown_tx,
        })
    }

    /// Run the gateway until a shutdown signal or a fatal error.
    ///
    /// # Errors
    ///
    /// Bind and serve failures, and [`Error::Fatal`] raised by a background
    /// task while serving.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (fatal_tx, fatal_rx) = mpsc::channel(1);
        credentials::spawn_refresh(
            Arc::clone(&self.credentials),
            self.config.credentials.refresh_interval,
            fatal_tx,
            self.shutdown_tx.subscribe(),
        );

        let app = create_router(&self.state);
        let fatal = Arc::new(Mutex::new(None));
        let trigger = shutdown_trigger(fatal_rx, self.shutdown_tx.clone(), Arc::clone(&fatal));
        let tls = &self.config.server.tls;

        info!("============================================================");
        info!("KUBE AUTH PROXY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, tls = tls.enabled(), "Listening");
        info!(upstream = %self.state.transport.base_url(), "Upstream API server");
        info!(
            max_per_user = self.config.tokens.max_per_user,
            expiration = ?self.config.tokens.expiration,
            "Opaque tokens"
        );
        info!("Local endpoints:");
        info!("  GET    /_/healthz");
        info!("  GET    /_/whoami");
        info!("  GET    /_/tokens | POST /_/tokens | DELETE /_/tokens/{{token}}");
        info!("  GET    /_/oauth/redirect | /_/oauth/callback | /_/oauth/userinfo");
        info!("============================================================");

        let served = if let (Some(cert), Some(key)) = (&tls.cert_file, &tls.key_file) {
            // Both rustls backends may be linked in; pin the process default.
            let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

            let tls_config = RustlsConfig::from_pem_file(cert, key)
                .await
                .map_err(|e| Error::Config(format!("Failed to load TLS files: {e}")))?;

            let handle = axum_server::Handle::new();
            let shutdown_handle = handle.clone();
            let timeout = self.config.server.shutdown_timeout;
            tokio::spawn(async move {
                trigger.await;
                shutdown_handle.graceful_shutdown(Some(timeout));
            });

            axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(app.into_make_service())
                .await
        } else {
            let listener = TcpListener::bind(addr).await?;
            let mut draining = self.shutdown_tx.subscribe();
            let timeout = self.config.server.shutdown_timeout;

            tokio::select! {
                served = axum::serve(listener, app).with_graceful_shutdown(trigger).into_future() => served,
                () = async move {
                    let _ = draining.recv().await;
                    tokio::time::sleep(timeout).await;
                } => {
                    warn!(timeout = ?timeout, "Graceful shutdown timed out, dropping open connections");
                    Ok(())
                }
            }
        };

        served.map_err(|e| Error::Internal(e.to_string()))?;

        if let Some(e) = fatal.lock().take() {
            return Err(e);
        }

        info!("Server stopped");
        Ok(())
    }
}

/// Completes on the first of an OS signal or a fatal error from a
/// background task. Fires the shutdown broadcast before returning.
fn shutdown_trigger(
    mut fatal_rx: mpsc::Receiver<Error>,
    shutdown_tx: broadcast::Sender<()>,
    slot: Arc<Mutex<Option<Error>>>,
) -> impl Future<Output = ()> + Send + 'static {
    async move {
        tokio::select! {
            () = shutdown_signal() => {
                info!("Shutdown signal received");
            }
            Some(e) = fatal_rx.recv() => {
                error!(error = %e, "Fatal error, shutting down");
                *slot.lock() = Some(e);
            }
        }
        let _ = shutdown_tx.send(());
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

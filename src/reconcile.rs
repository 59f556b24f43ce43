//! User directory reconciliation.
//!
//! After a provider login the resolved identity is upserted as a `User`
//! object on the upstream so that cluster-side controllers can provision
//! for it. The upsert is idempotent: an existing object is left alone and a
//! create that races another create is not an error.

use std::sync::Arc;

use reqwest::StatusCode;
use serde_json::json;
use tracing::{debug, info};

use crate::config::ReconcileConfig;
use crate::gateway::proxy::UpstreamTransport;
use crate::identity::Identity;
use crate::{Error, Result};

/// Directory of known users.
#[async_trait::async_trait]
pub trait UserDirectory: Send + Sync + 'static {
    /// Ensure a record exists for `identity`.
    ///
    /// # Errors
    ///
    /// [`Error::Internal`] for any failure other than "already exists".
    async fn upsert(&self, identity: &Identity) -> Result<()>;
}

/// Directory used when reconciliation is disabled.
#[derive(Debug, Default)]
pub struct NoopDirectory;

#[async_trait::async_trait]
impl UserDirectory for NoopDirectory {
    async fn upsert(&self, _identity: &Identity) -> Result<()> {
        Ok(())
    }
}

/// `User` objects on the upstream API, written with the service credential.
pub struct KubeUserDirectory {
    transport: Arc<UpstreamTransport>,
    config: ReconcileConfig,
}

impl KubeUserDirectory {
    /// Create a directory writing through `transport`.
    pub fn new(transport: Arc<UpstreamTransport>, config: ReconcileConfig) -> Self {
        Self { transport, config }
    }

    fn collection_url(&self) -> String {
        format!(
            "{}{}",
            self.transport.base_url().trim_end_matches('/'),
            self.config.resource_path
        )
    }

    /// The object created for `identity`.
    #[must_use]
    pub fn user_object(&self, identity: &Identity) -> serde_json::Value {
        json!({
            "apiVersion": self.config.api_version,
            "kind": "User",
            "metadata": { "name": identity.uid },
            "spec": {
                "username": identity.username,
                "uid": identity.uid,
                "groups": identity.groups,
                "extra": identity.extra,
            }
        })
    }
}

#[async_trait::async_trait]
impl UserDirectory for KubeUserDirectory {
    async fn upsert(&self, identity: &Identity) -> Result<()> {
        if identity.uid.is_empty() {
            return Err(Error::Internal("cannot reconcile identity without uid".to_string()));
        }

        let client = self.transport.client()?;
        let token = self.transport.credentials().token();
        let collection = self.collection_url();

        let existing = client
            .get(format!("{collection}/{}", identity.uid))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("User lookup failed: {e}")))?;

        match existing.status() {
            status if status.is_success() => {
                debug!(uid = %identity.uid, "User already reconciled");
                return Ok(());
            }
            StatusCode::NOT_FOUND => {}
            status => {
                return Err(Error::Internal(format!("User lookup failed: HTTP {status}")));
            }
        }

        let created = client
            .post(&collection)
            .bearer_auth(&token)
            .json(&self.user_object(identity))
            .send()
            .await
            .map_err(|e| Error::Internal(format!("User create failed: {e}")))?;

        match created.status() {
            status if status.is_success() => {
                info!(uid = %identity.uid, "Created user");
                Ok(())
            }
            StatusCode::CONFLICT => Ok(()),
            status => Err(Error::Internal(format!("User create failed: HTTP {status}"))),
        }
    }
}

//! Upstream transport and request forwarding.
//!
//! One pooled `reqwest` client is kept per credential generation: when the
//! credential cache swaps in a rotated CA bundle, the next request builds a
//! fresh client trusting it. Request and response bodies are streamed.
//!
//! Protocol upgrades (`kubectl exec`, `attach`, `port-forward`) keep their
//! `Connection`/`Upgrade` headers. When the upstream answers `101`, both
//! upgraded connections are joined and bytes are copied until either side
//! closes.

use std::sync::Arc;

use axum::{
    Extension,
    body::{Body, HttpBody},
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use reqwest::Client;
use tracing::{debug, info, warn};
use url::Url;

use super::impersonate;
use crate::config::UpstreamConfig;
use crate::credentials::{CredentialBundle, CredentialCache};
use crate::identity::Identity;
use crate::{Error, Result};

/// Headers that describe one connection hop and are never forwarded.
static HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
    headers.remove(header::HOST);
}

/// The protocol named by `Upgrade` when `Connection` carries the `upgrade`
/// token.
pub fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let requested = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if requested {
        headers.get(header::UPGRADE).cloned()
    } else {
        None
    }
}

/// Put back the headers that request a protocol switch.
fn mark_upgrade(headers: &mut HeaderMap, protocol: HeaderValue) {
    headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(header::UPGRADE, protocol);
}

/// Connection-pooled client to the upstream API server.
pub struct UpstreamTransport {
    config: UpstreamConfig,
    base_url: String,
    credentials: Arc<CredentialCache>,
    client: Mutex<Option<(u64, Client)>>,
}

impl UpstreamTransport {
    /// Create a transport for `config.url`.
    pub fn new(config: UpstreamConfig, credentials: Arc<CredentialCache>) -> Result<Self> {
        let url = Url::parse(&config.url)
            .map_err(|e| Error::Config(format!("Invalid upstream URL: {e}")))?;
        let base_url = url.as_str().trim_end_matches('/').to_string();

        Ok(Self {
            config,
            base_url,
            credentials,
            client: Mutex::new(None),
        })
    }

    /// Upstream base URL without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The service credential source.
    #[must_use]
    pub fn credentials(&self) -> &Arc<CredentialCache> {
        &self.credentials
    }

    /// A client trusting the current CA bundle.
    pub fn client(&self) -> Result<Client> {
        self.client_for(&self.credentials.snapshot())
    }

    fn client_for(&self, bundle: &CredentialBundle) -> Result<Client> {
        let mut cached = self.client.lock();
        if let Some((generation, client)) = cached.as_ref() {
            if *generation == bundle.generation {
                return Ok(client.clone());
            }
        }

        let client = self.build_client(bundle)?;
        info!(generation = bundle.generation, "Built upstream client");
        *cached = Some((bundle.generation, client.clone()));
        Ok(client)
    }

    fn build_client(&self, bundle: &CredentialBundle) -> Result<Client> {
        let mut builder = Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .tcp_keepalive(self.config.tcp_keepalive)
            .pool_idle_timeout(self.config.pool_idle_timeout)
            .pool_max_idle_per_host(self.config.pool_max_idle_per_host)
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::none());

        for cert in &bundle.root_certs {
            builder = builder.add_root_certificate(cert.clone());
        }

        builder
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create upstream client: {e}")))
    }

    /// Forward `request` upstream as `identity`.
    ///
    /// The request is rewritten in order: impersonation headers are stripped
    /// and injected, the caller's credential is replaced by the service
    /// token, hop-by-hop headers are dropped. Only then is it sent.
    ///
    /// An upgrade request arriving on a connection that can be upgraded
    /// keeps its `Upgrade` protocol; a `101` reply is tunnelled.
    pub async fn forward(&self, request: Request, identity: &Identity) -> Result<Response> {
        let (mut parts, body) = request.into_parts();
        let bundle = self.credentials.snapshot();

        let upgrade = upgrade_protocol(&parts.headers)
            .and_then(|protocol| Some((protocol, parts.extensions.remove::<OnUpgrade>()?)));

        impersonate::render(&mut parts.headers, identity, &bundle.token)?;
        strip_hop_by_hop(&mut parts.headers);
        if let Some((protocol, _)) = &upgrade {
            mark_upgrade(&mut parts.headers, protocol.clone());
        }

        let path_and_query = parts.uri.path_and_query().map_or("/", |pq| pq.as_str());
        let url = format!("{}{path_and_query}", self.base_url);

        let client = self.client_for(&bundle)?;
        let mut outbound = client
            .request(parts.method.clone(), &url)
            .headers(parts.headers);
        if body.size_hint().exact() != Some(0) {
            outbound = outbound.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let upstream = outbound.send().await.map_err(|e| {
            warn!(method = %parts.method, url = %url, error = %e, "Upstream request failed");
            Error::Upstream(e.to_string())
        })?;

        let status = upstream.status();
        debug!(method = %parts.method, path = %parts.uri.path(), status = %status, "Proxied request");

        if let Some((protocol, client)) = upgrade
            && status == StatusCode::SWITCHING_PROTOCOLS
        {
            return tunnel(upstream, protocol, client).await;
        }

        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Relay a `101` and join the client and upstream connections.
async fn tunnel(
    upstream: reqwest::Response,
    requested: HeaderValue,
    client: OnUpgrade,
) -> Result<Response> {
    let mut headers = upstream.headers().clone();
    let protocol = headers.get(header::UPGRADE).cloned().unwrap_or(requested);
    strip_hop_by_hop(&mut headers);
    mark_upgrade(&mut headers, protocol);

    let mut upstream_io = upstream.upgrade().await.map_err(|e| {
        warn!(error = %e, "Upstream upgrade failed");
        Error::Upstream(e.to_string())
    })?;

    tokio::spawn(async move {
        let upgraded = match client.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(error = %e, "Client upgrade failed");
                return;
            }
        };
        let mut client_io = TokioIo::new(upgraded);
        match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
            Ok((sent, received)) => debug!(sent, received, "Upgraded connection closed"),
            Err(e) => debug!(error = %e, "Upgraded connection aborted"),
        }
    });

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Fallback handler: proxy everything not served locally.
pub async fn proxy_handler(
    State(transport): State<Arc<UpstreamTransport>>,
    Extension(identity): Extension<Identity>,
    request: Request,
) -> Response {
    match transport.forward(request, &identity).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

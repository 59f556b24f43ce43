//! Impersonation header rendering.
//!
//! Every caller-supplied header starting with `Impersonate-` is removed
//! before the resolved identity is written, so a caller can never smuggle
//! its own impersonation claims past the proxy. The caller's credential is
//! replaced by the proxy's service token.

use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use tracing::warn;

use crate::identity::Identity;
use crate::{Error, Result};

/// Lowercase prefix shared by every impersonation header.
pub const IMPERSONATE_PREFIX: &str = "impersonate-";

/// `Impersonate-User`
pub const IMPERSONATE_USER: &str = "impersonate-user";
/// `Impersonate-Group`
pub const IMPERSONATE_GROUP: &str = "impersonate-group";
/// `Impersonate-Uid`
pub const IMPERSONATE_UID: &str = "impersonate-uid";
/// Prefix of `Impersonate-Extra-<key>`
pub const IMPERSONATE_EXTRA_PREFIX: &str = "impersonate-extra-";

/// Remove every impersonation header.
pub fn strip(headers: &mut HeaderMap) {
    let names: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with(IMPERSONATE_PREFIX))
        .cloned()
        .collect();
    for name in names {
        headers.remove(&name);
    }
}

/// Rewrite `headers` to impersonate `identity` with the proxy's own
/// `service_token`.
///
/// Stripping always completes before anything is injected.
///
/// # Errors
///
/// [`Error::Invalid`] when the identity has no group, or its username, group
/// or uid cannot be carried in a header. Nothing is forwarded in that case:
/// a request without impersonation headers would run as the proxy itself.
pub fn render(headers: &mut HeaderMap, identity: &Identity, service_token: &str) -> Result<()> {
    strip(headers);

    let group = identity
        .primary_group()
        .ok_or_else(|| Error::Invalid("identity has no groups".to_string()))?;

    headers.insert(IMPERSONATE_USER, value(identity.username.as_str(), "username")?);
    headers.insert(IMPERSONATE_GROUP, value(group, "group")?);
    if !identity.uid.is_empty() {
        headers.insert(IMPERSONATE_UID, value(identity.uid.as_str(), "uid")?);
    }

    for (key, extra) in &identity.extra {
        let name = HeaderName::from_bytes(extra_header_name(key).as_bytes());
        match (name, HeaderValue::from_bytes(extra.as_bytes())) {
            (Ok(name), Ok(val)) => {
                headers.insert(name, val);
            }
            _ => warn!(key = %key, "Skipping extra attribute not representable as a header"),
        }
    }

    let mut authorization = HeaderValue::from_str(&format!("Bearer {service_token}"))
        .map_err(|_| Error::Internal("service token is not a valid header value".to_string()))?;
    authorization.set_sensitive(true);
    headers.insert(header::AUTHORIZATION, authorization);

    Ok(())
}

fn value(raw: &str, field: &str) -> Result<HeaderValue> {
    HeaderValue::from_bytes(raw.as_bytes())
        .map_err(|_| Error::Invalid(format!("identity {field} is not a valid header value")))
}

/// `impersonate-extra-<key>` with the key lowercased and every byte outside
/// the unreserved set percent-encoded, as the API server decodes it.
fn extra_header_name(key: &str) -> String {
    let mut name = String::with_capacity(IMPERSONATE_EXTRA_PREFIX.len() + key.len());
    name.push_str(IMPERSONATE_EXTRA_PREFIX);
    for byte in key.to_lowercase().bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            name.push(char::from(byte));
        } else {
            name.push_str(&format!("%{byte:02X}"));
        }
    }
    name
}

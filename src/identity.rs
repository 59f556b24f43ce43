//! Resolved caller identity.
//!
//! An [`Identity`] is what every successful authentication produces and what
//! the impersonation layer renders onto the upstream request. It is also the
//! value persisted under an opaque token key, so its serialized form is a
//! stable wire contract: compact JSON with single-letter keys
//! (`i` = uid, `u` = username, `g` = groups, `e` = extra).

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::{Error, Result};

/// Username of the fixed anonymous identity.
pub const ANONYMOUS_USERNAME: &str = "system:anonymous";

/// Group of the fixed anonymous identity.
pub const UNAUTHENTICATED_GROUP: &str = "system:unauthenticated";

/// The principal a request is made on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable unique identifier; empty only for anonymous.
    #[serde(rename = "i", default, deserialize_with = "null_as_default")]
    pub uid: String,
    /// Login name.
    #[serde(rename = "u", default, deserialize_with = "null_as_default")]
    pub username: String,
    /// Group memberships; the first entry is the one impersonated.
    #[serde(rename = "g", default, deserialize_with = "null_as_default")]
    pub groups: Vec<String>,
    /// Additional profile attributes.
    #[serde(rename = "e", default, deserialize_with = "null_as_default")]
    pub extra: BTreeMap<String, String>,
}

impl Identity {
    /// The identity of a request that carries no credential.
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            uid: String::new(),
            username: ANONYMOUS_USERNAME.to_string(),
            groups: vec![UNAUTHENTICATED_GROUP.to_string()],
            extra: BTreeMap::new(),
        }
    }

    /// Whether this is the anonymous identity.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.uid.is_empty() && self.username == ANONYMOUS_USERNAME
    }

    /// Key under which this identity owns opaque tokens: the uid, or the
    /// username when there is no uid.
    #[must_use]
    pub fn owner(&self) -> &str {
        if self.uid.is_empty() {
            &self.username
        } else {
            &self.uid
        }
    }

    /// The group rendered as `Impersonate-Group`.
    ///
    /// Resolution never yields an identity without groups; see [`Self::validate`].
    #[must_use]
    pub fn primary_group(&self) -> Option<&str> {
        self.groups.first().map(String::as_str)
    }

    /// Reject identities that cannot be rendered onto a request.
    pub fn validate(&self) -> Result<()> {
        if self.username.is_empty() {
            return Err(Error::Invalid("identity has no username".to_string()));
        }
        if self.groups.is_empty() {
            return Err(Error::Invalid("identity has no groups".to_string()));
        }
        Ok(())
    }

    /// Serialize to the compact stored form.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse the compact stored form.
    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Older records were written with `null` for empty collections.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn alice() -> Identity {
        Identity {
            uid: "alice".to_string(),
            username: "alice".to_string(),
            groups: vec!["team-x".to_string()],
            extra: BTreeMap::from([("email".to_string(), "alice@example.com".to_string())]),
        }
    }

    #[test]
    fn anonymous_has_unauthenticated_group_and_no_uid() {
        let anon = Identity::anonymous();
        assert!(anon.uid.is_empty());
        assert_eq!(anon.username, "system:anonymous");
        assert_eq!(anon.primary_group(), Some("system:unauthenticated"));
        assert!(anon.is_anonymous());
        assert!(anon.validate().is_ok());
    }

    #[test]
    fn encodes_with_single_letter_keys() {
        let encoded = alice().encode().unwrap();
        assert_eq!(
            encoded,
            r#"{"i":"alice","u":"alice","g":["team-x"],"e":{"email":"alice@example.com"}}"#
        );
    }

    #[test]
    fn decode_accepts_null_collections() {
        // GIVEN: a record written with null extra
        let raw = r#"{"i":"","u":"bob","g":["devs"],"e":null}"#;

        // WHEN: decoded
        let identity = Identity::decode(raw).unwrap();

        // THEN: extra is empty rather than an error
        assert_eq!(identity.username, "bob");
        assert!(identity.extra.is_empty());
        assert_eq!(identity.owner(), "bob");
    }

    #[test]
    fn decode_then_encode_is_stable() {
        let original = alice();
        let decoded = Identity::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn validate_rejects_empty_groups() {
        let mut identity = alice();
        identity.groups.clear();
        assert!(matches!(identity.validate(), Err(Error::Invalid(_))));
    }

    #[test]
    fn owner_prefers_uid() {
        let mut identity = alice();
        identity.username = "Alice Display".to_string();
        assert_eq!(identity.owner(), "alice");
    }
}

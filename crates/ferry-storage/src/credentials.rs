//! Time- and permission-scoped access credentials.
//!
//! A credential grants access to exactly one queue or blob container. It is
//! signed with the store's account key so a holder cannot widen its scope or
//! extend its expiry without invalidating the signature.
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Queue,
    Container,
}

impl ResourceKind {
    fn code(self) -> &'static str {
        match self {
            ResourceKind::Queue => "q",
            ResourceKind::Container => "c",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permissions {
    pub read: bool,
    pub add: bool,
    pub process: bool,
    pub delete: bool,
}

impl Permissions {
    /// Request senders may only enqueue.
    pub const ADD_ONLY: Self = Self {
        read: false,
        add: true,
        process: false,
        delete: false,
    };

    /// Response consumers read, dequeue, and clean up.
    pub const READ_PROCESS_DELETE: Self = Self {
        read: true,
        add: false,
        process: true,
        delete: true,
    };

    /// True when every permission in `other` is also granted here.
    pub fn allows(&self, other: Permissions) -> bool {
        (!other.read || self.read)
            && (!other.add || self.add)
            && (!other.process || self.process)
            && (!other.delete || self.delete)
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (granted, letter) in [
            (self.read, 'r'),
            (self.add, 'a'),
            (self.process, 'p'),
            (self.delete, 'd'),
        ] {
            if granted {
                write!(f, "{letter}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopedCredential {
    pub resource: String,
    pub kind: ResourceKind,
    pub permissions: Permissions,
    pub expires_at: DateTime<Utc>,
    pub signature: String,
}

impl ScopedCredential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Query-string form handed to clients.
    pub fn to_token(&self) -> String {
        format!(
            "sr={}&sp={}&se={}&sig={}",
            self.kind.code(),
            self.permissions,
            self.expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.signature
        )
    }
}

/// Signs and verifies credentials with a shared account key.
#[derive(Clone)]
pub struct CredentialSigner {
    account_key: Vec<u8>,
}

impl fmt::Debug for CredentialSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSigner").finish_non_exhaustive()
    }
}

impl CredentialSigner {
    pub fn new(account_key: impl Into<Vec<u8>>) -> Self {
        Self {
            account_key: account_key.into(),
        }
    }

    pub fn issue(
        &self,
        resource: &str,
        kind: ResourceKind,
        permissions: Permissions,
        expires_at: DateTime<Utc>,
    ) -> ScopedCredential {
        // Truncate to whole seconds so the token round-trips exactly.
        let expires_at = DateTime::<Utc>::from_timestamp(expires_at.timestamp(), 0)
            .unwrap_or(expires_at);
        let signature = self.sign(resource, kind, permissions, expires_at);
        ScopedCredential {
            resource: resource.to_string(),
            kind,
            permissions,
            expires_at,
            signature,
        }
    }

    pub fn verify(&self, credential: &ScopedCredential) -> bool {
        let expected = self.sign(
            &credential.resource,
            credential.kind,
            credential.permissions,
            credential.expires_at,
        );
        expected == credential.signature
    }

    fn sign(
        &self,
        resource: &str,
        kind: ResourceKind,
        permissions: Permissions,
        expires_at: DateTime<Utc>,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.account_key);
        hasher.update(b"\n");
        hasher.update(kind.code().as_bytes());
        hasher.update(b"\n");
        hasher.update(resource.as_bytes());
        hasher.update(b"\n");
        hasher.update(permissions.to_string().as_bytes());
        hasher.update(b"\n");
        hasher.update(expires_at.timestamp().to_be_bytes());
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn permission_letters_follow_fixed_order() {
        assert_eq!(Permissions::ADD_ONLY.to_string(), "a");
        assert_eq!(Permissions::READ_PROCESS_DELETE.to_string(), "rpd");
    }

    #[test]
    fn allows_is_subset_check() {
        assert!(Permissions::READ_PROCESS_DELETE.allows(Permissions {
            read: true,
            ..Default::default()
        }));
        assert!(!Permissions::ADD_ONLY.allows(Permissions::READ_PROCESS_DELETE));
        assert!(Permissions::ADD_ONLY.allows(Permissions::default()));
    }

    #[test]
    fn issued_credential_verifies_and_tampering_fails() {
        let signer = CredentialSigner::new(b"secret".to_vec());
        let expires = Utc::now() + Duration::days(10);
        let credential = signer.issue("responses-a", ResourceKind::Queue, Permissions::ADD_ONLY, expires);
        assert!(signer.verify(&credential));

        let mut widened = credential.clone();
        widened.permissions = Permissions::READ_PROCESS_DELETE;
        assert!(!signer.verify(&widened));

        let other = CredentialSigner::new(b"other".to_vec());
        assert!(!other.verify(&credential));
    }

    #[test]
    fn expiry_and_token_shape() {
        let signer = CredentialSigner::new(b"k".to_vec());
        let now = Utc::now();
        let credential = signer.issue(
            "blobs",
            ResourceKind::Container,
            Permissions::READ_PROCESS_DELETE,
            now + Duration::days(2),
        );
        assert!(!credential.is_expired(now));
        assert!(credential.is_expired(now + Duration::days(3)));
        let token = credential.to_token();
        assert!(token.starts_with("sr=c&sp=rpd&se="));
        assert!(token.ends_with(&credential.signature));
    }
}

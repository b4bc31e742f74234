//! SSH key material and its content hash.
//!
//! Keys are compared by `KeyHash` (SHA-256 of the key content), never by
//! name: the same material may be labelled differently in different places.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::{CoreError, InvalidId};

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyHash(String);

impl KeyHash {
    pub fn of_content(content: &str) -> Self {
        let digest = Sha256::digest(content.trim().as_bytes());
        Self(hex::encode(digest))
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let lowered = s.trim().to_ascii_lowercase();
        if lowered.len() != 64 || !lowered.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(InvalidId::KeyHash {
                raw: s.to_string(),
                reason: "expected 64 hex characters".into(),
            }
            .into());
        }
        Ok(Self(lowered))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Debug for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyHash({})", self.short())
    }
}

impl fmt::Display for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for KeyHash {
    type Error = CoreError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        KeyHash::parse(&s)
    }
}

impl From<KeyHash> for String {
    fn from(hash: KeyHash) -> String {
        hash.0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshKey {
    pub name: String,
    #[serde(default = "default_key_type")]
    pub key_type: String,
    pub content: String,
}

fn default_key_type() -> String {
    "ssh-rsa".to_string()
}

impl SshKey {
    pub fn new(
        name: impl Into<String>,
        key_type: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            key_type: key_type.into(),
            content: content.into(),
        }
    }

    pub fn hash(&self) -> KeyHash {
        KeyHash::of_content(&self.content)
    }
}

/// Authorized keys for one gear, by content hash → display name.
pub type KeySet = BTreeMap<KeyHash, String>;

/// Fold keys into a `KeySet`. The first name seen for a hash wins.
pub fn key_set<'a>(keys: impl IntoIterator<Item = &'a SshKey>) -> KeySet {
    let mut set = KeySet::new();
    for key in keys {
        set.entry(key.hash()).or_insert_with(|| key.name.clone());
    }
    set
}

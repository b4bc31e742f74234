//! Layer 1: Identity atoms
//!
//! Uuid-backed ids for every stored entity, plus `NodeId` (a node's server
//! identity, usually a hostname) which is a free-form string.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{CoreError, InvalidId};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $variant:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new(id: Uuid) -> Self {
                Self(id)
            }

            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn parse_str(s: &str) -> Result<Self, CoreError> {
                parse_uuid_id(s, |raw, reason| InvalidId::$variant { raw, reason }).map(Self)
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl std::str::FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse_str(s)
            }
        }
    };
}

uuid_id!(
    /// Application aggregate id.
    AppId,
    Application
);
uuid_id!(
    /// Operation group id, unique within its application.
    GroupId,
    Group
);
uuid_id!(
    /// Operation record id, unique within its application.
    OpId,
    Operation
);
uuid_id!(
    /// Quota-tracked owner.
    OwnerId,
    Owner
);
uuid_id!(DomainId, Domain);
uuid_id!(GearId, Gear);
uuid_id!(GroupInstanceId, GroupInstance);
uuid_id!(DistrictId, District);

/// Server identity of a worker node.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    pub fn new(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(InvalidId::Node {
                raw: s,
                reason: "empty".into(),
            }
            .into());
        }
        if trimmed.contains(['/', '\\']) || trimmed.starts_with('.') {
            return Err(InvalidId::Node {
                raw: s.clone(),
                reason: "must not contain path separators or start with '.'".into(),
            }
            .into());
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:?})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for NodeId {
    type Error = CoreError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        NodeId::new(s)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> String {
        id.0
    }
}

fn parse_uuid_id<F>(raw: &str, invalid: F) -> Result<Uuid, CoreError>
where
    F: FnOnce(String, String) -> InvalidId,
{
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(invalid(raw.to_string(), "empty".into()).into());
    }
    Uuid::parse_str(trimmed).map_err(|err| invalid(raw.to_string(), err.to_string()).into())
}

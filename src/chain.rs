//! Chain identifiers in the CAIP-2 `namespace:reference` form.
//!
//! x402 accept entries carry their network as a string such as `eip155:84532`
//! or `solana:devnet`. The router keeps the raw string on the wire types and
//! parses a [`ChainId`] only where a settlement strategy needs the pieces.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// The EVM namespace of CAIP-2 chain identifiers.
pub const EIP155: &str = "eip155";

/// A `namespace:reference` chain identifier.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ChainId {
    pub namespace: String,
    pub reference: String,
}

impl ChainId {
    pub fn eip155(chain_id: u64) -> Self {
        Self {
            namespace: EIP155.to_string(),
            reference: chain_id.to_string(),
        }
    }

    /// The numeric chain id when this is an `eip155` identifier.
    pub fn eip155_reference(&self) -> Option<u64> {
        if self.namespace == EIP155 {
            self.reference.parse().ok()
        } else {
            None
        }
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.reference)
    }
}

impl fmt::Debug for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid chain id format {0}")]
pub struct ChainIdError(String);

impl FromStr for ChainId {
    type Err = ChainIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, reference) = s.split_once(':').ok_or_else(|| ChainIdError(s.to_string()))?;
        if namespace.is_empty() || reference.is_empty() {
            return Err(ChainIdError(s.to_string()));
        }
        Ok(ChainId {
            namespace: namespace.to_string(),
            reference: reference.to_string(),
        })
    }
}

impl Serialize for ChainId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ChainId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ChainId::from_str(&s).map_err(de::Error::custom)
    }
}

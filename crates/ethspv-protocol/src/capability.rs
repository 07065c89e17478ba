//! Capability records -- named, versioned sub-protocols advertised in Hello.

use std::fmt;

use crate::rlp::{self, Encodable, Rlp};

/// Light client sub-protocol name.
pub const LES: &str = "les";

/// Message-id space per known capability version.
const MESSAGE_COUNTS: &[(&str, u64, u64)] = &[
    ("les", 1, 15),
    ("les", 2, 22),
    ("eth", 62, 8),
    ("eth", 63, 17),
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Capability {
    pub name: String,
    pub version: u64,
}

impl Capability {
    pub fn new(name: impl Into<String>, version: u64) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    /// `les/2`, the version this client speaks.
    pub fn les2() -> Self {
        Self::new(LES, 2)
    }

    /// Number of message ids this capability occupies once negotiated.
    /// Unknown capabilities occupy none.
    pub fn message_count(&self) -> u64 {
        MESSAGE_COUNTS
            .iter()
            .find(|(name, version, _)| *name == self.name && *version == self.version)
            .map(|(_, _, count)| *count)
            .unwrap_or(0)
    }

    pub fn decode(item: &Rlp) -> rlp::Result<Self> {
        let fields = item.fields(2)?;
        Ok(Self {
            name: fields[0].as_text()?,
            version: fields[1].as_u64()?,
        })
    }
}

impl Encodable for Capability {
    fn to_rlp(&self) -> Rlp {
        Rlp::list(vec![self.name.to_rlp(), self.version.to_rlp()])
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

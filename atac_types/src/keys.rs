//! Typed aggregation keys.
//!
//! Artifact identity at every pipeline level is one of these keys, rendered
//! through `Display`. Grouping and lookups go through the projection methods
//! rather than string manipulation on rendered names.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one technical sequencing library: a condition plus a 1-based
/// biological replicate index plus a 1-based technical replicate index.
#[derive(Serialize, Deserialize, Clone, PartialOrd, Ord, PartialEq, Eq, Hash, Debug)]
pub struct LibraryKey {
    pub condition: String,
    pub replicate: u32,
    pub technical: u32,
}

impl LibraryKey {
    /// The replicate this library contributes to.
    pub fn replicate_key(&self) -> ReplicateKey {
        ReplicateKey {
            condition: self.condition.clone(),
            replicate: self.replicate,
        }
    }

    /// The condition this library contributes to.
    pub fn condition_key(&self) -> ConditionKey {
        ConditionKey {
            condition: self.condition.clone(),
        }
    }
}

impl fmt::Display for LibraryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_R{:02}_T{:02}",
            self.condition, self.replicate, self.technical
        )
    }
}

/// Identity of one biological replicate, aggregating its technical libraries.
#[derive(Serialize, Deserialize, Clone, PartialOrd, Ord, PartialEq, Eq, Hash, Debug)]
pub struct ReplicateKey {
    pub condition: String,
    pub replicate: u32,
}

impl ReplicateKey {
    pub fn condition_key(&self) -> ConditionKey {
        ConditionKey {
            condition: self.condition.clone(),
        }
    }
}

impl fmt::Display for ReplicateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_R{:02}", self.condition, self.replicate)
    }
}

/// Identity of one experimental condition, aggregating its replicates.
#[derive(Serialize, Deserialize, Clone, PartialOrd, Ord, PartialEq, Eq, Hash, Debug)]
pub struct ConditionKey {
    pub condition: String,
}

impl ConditionKey {
    pub fn new(condition: impl Into<String>) -> ConditionKey {
        ConditionKey {
            condition: condition.into(),
        }
    }
}

impl fmt::Display for ConditionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.condition)
    }
}

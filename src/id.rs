//! Identifier allocation and short-id resolution.
//!
//! Ids are the hex form of a 160-bit digest of a random 128-bit integer.
//! Operators see and type the 12-character suffix ("short id").
//! Collisions against existing state are not checked.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Length of the operator-facing id suffix.
pub const SHORT_ID_LEN: usize = 12;

/// Number of digest bytes kept for a full id (160 bits).
const ID_BYTES: usize = 20;

/// Opaque identifier for machines, projects and containers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    /// Mint a fresh id.
    pub fn new() -> Self {
        let seed: u128 = rand::random();
        Self::from_seed(seed)
    }

    fn from_seed(seed: u128) -> Self {
        let digest = Sha256::digest(seed.to_string().as_bytes());
        Id(hex::encode(&digest[..ID_BYTES]))
    }

    /// The 12-character suffix shown to operators.
    pub fn short(&self) -> &str {
        // ids read from a replica are not guaranteed to be ascii
        let start = self
            .0
            .char_indices()
            .rev()
            .nth(SHORT_ID_LEN - 1)
            .map_or(0, |(i, _)| i);
        &self.0[start..]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Id(s.to_string())
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Id(s)
    }
}

/// Resolve an operator-supplied suffix against candidate ids.
///
/// Exactly one candidate must end with `short`; zero or several matches
/// fail with [`Error::AmbiguousOrNotFound`].
pub fn resolve_short<'a, I>(short: &str, candidates: I) -> Result<Id>
where
    I: IntoIterator<Item = &'a Id>,
{
    let short = short.trim();
    let matches: Vec<&Id> = if short.is_empty() {
        Vec::new()
    } else {
        candidates
            .into_iter()
            .filter(|id| id.as_str().ends_with(short))
            .collect()
    };

    match matches.as_slice() {
        [only] => Ok((*only).clone()),
        _ => Err(Error::AmbiguousOrNotFound {
            short: short.to_string(),
            matches: matches.len(),
        }),
    }
}

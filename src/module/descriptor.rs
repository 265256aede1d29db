//! Module descriptors: the persistent identity of one data connection.

use crate::error::RuntimeError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadState {
    Unloaded,
    Loading,
    Loaded,
    Failed,
}

/// Input to `load_module`: a compiled connection module ready to host.
#[derive(Clone, Debug)]
pub struct ModuleSpec {
    pub name: String,
    pub connection_kind: String,
    pub connection_string: String,
    pub binary: Vec<u8>,
    pub symbols: Option<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub struct ModuleDescriptor {
    pub name: String,
    pub connection_kind: String,
    pub connection_string: String,
    pub binary: Vec<u8>,
    pub symbols: Option<Vec<u8>>,
    pub content_hash: String,
    pub state: LoadState,
}

impl ModuleDescriptor {
    pub fn from_spec(spec: &ModuleSpec, state: LoadState) -> Self {
        ModuleDescriptor {
            name: spec.name.clone(),
            connection_kind: spec.connection_kind.clone(),
            connection_string: spec.connection_string.clone(),
            binary: spec.binary.clone(),
            symbols: spec.symbols.clone(),
            content_hash: binary_hash(&spec.binary),
            state,
        }
    }
}

/// SHA-256 of the compiled binary; replace detection and persistence both
/// key on it.
pub fn binary_hash(binary: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(binary);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

static NAME_RE: OnceLock<Regex> = OnceLock::new();

/// Module and query names: identifier-like, bounded, usable in paths and
/// table rows.
pub fn validate_name(name: &str) -> Result<(), RuntimeError> {
    let re = NAME_RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z][A-Za-z0-9_-]{0,63}$").expect("name pattern is valid")
    });
    if re.is_match(name) {
        Ok(())
    } else {
        Err(RuntimeError::InvalidModuleDefinition(format!(
            "invalid name `{name}`: expected [A-Za-z][A-Za-z0-9_-]{{0,63}}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_the_identifier_convention() {
        assert!(validate_name("Northwind").is_ok());
        assert!(validate_name("crm-replica_2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("1bad").is_err());
        assert!(validate_name("has space").is_err());
    }

    #[test]
    fn binary_hash_is_stable() {
        assert_eq!(binary_hash(b"abc"), binary_hash(b"abc"));
        assert_ne!(binary_hash(b"abc"), binary_hash(b"abd"));
        assert_eq!(binary_hash(b"abc").len(), 64);
    }
}

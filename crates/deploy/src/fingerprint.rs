//! Fingerprints used to detect drift between a unit's declaration and its artifact.

use std::{collections::BTreeMap, fmt};

use alloy_core::primitives::keccak256;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// A hex-encoded digest (without `0x` prefix).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Fingerprint of constructor/initialization arguments.
    ///
    /// Arguments are rendered as canonical JSON (object keys sorted, no
    /// whitespace) before hashing so that logically equal argument lists always
    /// produce the same SHA-256 digest.
    pub fn of_args(args: &[Value]) -> Self {
        let canonical = canonical_json(&Value::Array(args.to_vec()));

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Fingerprint of deployed logic: the keccak-256 of the creation bytecode.
    pub fn of_code(bytecode: &[u8]) -> Self {
        Self(hex::encode(keccak256(bytecode)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines and tables.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short())
    }
}

/// Render a JSON value with sorted object keys and no insignificant whitespace.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let sorted: BTreeMap<&String, String> =
                map.iter().map(|(k, v)| (k, canonical_json(v))).collect();
            let items: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), v))
                .collect();
            format!("{{{}}}", items.join(","))
        }
        // Scalars already have a unique serialization.
        scalar => scalar.to_string(),
    }
}

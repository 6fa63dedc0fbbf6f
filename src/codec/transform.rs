//! Per-position decode strategies for framed payloads.
//!
//! Providers have been seen shipping incompatible schemes, so the transform
//! is data: a tagged [`TransformSpec`] loaded from configuration and built
//! into a [`DecodeTransform`] object.

use super::CodecError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Recovers one plaintext byte from one ciphertext byte.
pub trait DecodeTransform: Send + Sync + std::fmt::Debug {
    fn decode_byte(&self, byte: u8, position: usize, key: &[u8]) -> u8;
}

/// Configuration form of a transform, e.g.
/// `{"kind":"xor"}` or `{"kind":"positional-substitution","table":[...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TransformSpec {
    /// Repeating-key XOR. Uses `key` when set, otherwise the header key.
    Xor {
        #[serde(default)]
        key: Option<String>,
    },
    /// `plain = table[cipher - key[pos % len] - pos]` (all mod 256).
    PositionalSubstitution { table: Vec<u8> },
}

impl Default for TransformSpec {
    fn default() -> Self {
        TransformSpec::Xor { key: None }
    }
}

impl TransformSpec {
    pub fn build(&self) -> Result<Arc<dyn DecodeTransform>, CodecError> {
        match self {
            TransformSpec::Xor { key } => Ok(Arc::new(RepeatingXor {
                fixed_key: key.as_ref().map(|k| k.as_bytes().to_vec()),
            })),
            TransformSpec::PositionalSubstitution { table } => {
                Ok(Arc::new(PositionalSubstitution::new(table)?))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RepeatingXor {
    fixed_key: Option<Vec<u8>>,
}

impl DecodeTransform for RepeatingXor {
    fn decode_byte(&self, byte: u8, position: usize, key: &[u8]) -> u8 {
        let key = self.fixed_key.as_deref().unwrap_or(key);
        if key.is_empty() {
            return byte;
        }
        byte ^ key[position % key.len()]
    }
}

#[derive(Debug, Clone)]
pub struct PositionalSubstitution {
    table: [u8; 256],
}

impl PositionalSubstitution {
    /// The table must be a permutation of 0..=255.
    pub fn new(table: &[u8]) -> Result<Self, CodecError> {
        let table: [u8; 256] = table.try_into().map_err(|_| {
            CodecError::InvalidKeyMaterial(format!(
                "substitution table needs 256 entries, got {}",
                table.len()
            ))
        })?;
        let mut seen = [false; 256];
        for &b in &table {
            if std::mem::replace(&mut seen[b as usize], true) {
                return Err(CodecError::InvalidKeyMaterial(format!(
                    "substitution table repeats byte {b}"
                )));
            }
        }
        Ok(Self { table })
    }
}

impl DecodeTransform for PositionalSubstitution {
    fn decode_byte(&self, byte: u8, position: usize, key: &[u8]) -> u8 {
        let salt = if key.is_empty() {
            0
        } else {
            key[position % key.len()]
        };
        let index = byte.wrapping_sub(salt).wrapping_sub(position as u8);
        self.table[index as usize]
    }
}

//! Structural fingerprints of discretized solver state.

use crate::types::FieldSummary;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// Default quantum used by [`Fingerprint::of_state`] callers that have no
/// better notion of the solver's discretization error.
pub const DEFAULT_QUANTUM: f64 = 1e-6;

/// Content-addressed digest of a solver state summary.
///
/// Serialized as a lowercase hex string so audit exports stay readable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    /// Compute the fingerprint of a field summary and parameter vector.
    ///
    /// Every value is snapped to a grid of width `quantum` before hashing, so two
    /// states closer than the discretization error share a digest.
    pub fn of_state(field: &FieldSummary, parameters: &[f64], quantum: f64) -> Self {
        let mut hasher = Sha256::new();

        for value in field.as_vector() {
            hasher.update(quantize(value, quantum).to_le_bytes());
        }
        hasher.update((parameters.len() as u32).to_le_bytes());
        for value in parameters {
            hasher.update(quantize(*value, quantum).to_le_bytes());
        }

        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 16 hex chars, for log lines.
    pub fn short(&self) -> String {
        let mut s = self.to_hex();
        s.truncate(16);
        s
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

fn quantize(value: f64, quantum: f64) -> i64 {
    if !value.is_finite() {
        // Distinct sentinels keep NaN/inf states from colliding with real ones.
        return if value.is_nan() {
            i64::MIN
        } else if value > 0.0 {
            i64::MAX
        } else {
            i64::MIN + 1
        };
    }
    if quantum <= 0.0 {
        return value.to_bits() as i64;
    }
    (value / quantum).round() as i64
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Fingerprint::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(v: f64) -> FieldSummary {
        FieldSummary {
            velocity_l2: v,
            pressure_mean: 0.5,
            kinetic_energy: 2.0,
            total_mass: 10.0,
        }
    }

    #[test]
    fn fingerprint_deterministic() {
        let fp1 = Fingerprint::of_state(&field(1.0), &[0.1, 0.2], DEFAULT_QUANTUM);
        let fp2 = Fingerprint::of_state(&field(1.0), &[0.1, 0.2], DEFAULT_QUANTUM);
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn fingerprint_absorbs_sub_quantum_noise() {
        let fp1 = Fingerprint::of_state(&field(1.0), &[0.1], 1e-6);
        let fp2 = Fingerprint::of_state(&field(1.0 + 1e-9), &[0.1], 1e-6);
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn fingerprint_changes_with_state() {
        let fp1 = Fingerprint::of_state(&field(1.0), &[0.1], 1e-6);
        let fp2 = Fingerprint::of_state(&field(1.1), &[0.1], 1e-6);
        assert_ne!(fp1, fp2);
    }

    #[test]
    fn fingerprint_changes_with_parameter_count() {
        let fp1 = Fingerprint::of_state(&field(1.0), &[0.0], 1e-6);
        let fp2 = Fingerprint::of_state(&field(1.0), &[0.0, 0.0], 1e-6);
        assert_ne!(fp1, fp2);
    }

    #[test]
    fn fingerprint_hex_serde() {
        let fp = Fingerprint::of_state(&field(1.0), &[], 1e-6);
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json.len(), 66);
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(fp, back);
        assert_eq!(fp.short().len(), 16);
    }
}

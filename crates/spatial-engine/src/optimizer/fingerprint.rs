//! Stable query fingerprints
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt;

/// Numeric arguments are quantized to this step (1 mm) before hashing.
pub const QUANTUM_METERS: f64 = 0.001;

/// `value` rounded to the nearest quantum. Snapping twice gives the same bits.
pub fn snap(value: f64) -> f64 {
    if value.is_finite() {
        (value / QUANTUM_METERS).round() * QUANTUM_METERS
    } else {
        value
    }
}

/// blake3 digest of a canonical (query kind, quantized arguments) encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short form for log lines.
    pub fn short(&self) -> String {
        self.to_string()[..12].to_string()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(blake3::Hash::from(self.0).to_hex().as_str())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Incremental canonical encoder. Every field is tagged and fixed-width.
pub struct FingerprintBuilder {
    hasher: blake3::Hasher,
}

impl FingerprintBuilder {
    pub fn new(kind: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"spatial-query/v1\0");
        hasher.update(kind.as_bytes());
        hasher.update(&[0]);
        Self { hasher }
    }

    pub fn meters(mut self, value: f64) -> Self {
        let quantized = (value / QUANTUM_METERS).round() as i64;
        self.hasher.update(b"m");
        self.hasher.update(&quantized.to_le_bytes());
        self
    }

    pub fn point(self, p: &crate::types::Point3D) -> Self {
        self.meters(p.x).meters(p.y).meters(p.z)
    }

    pub fn count(mut self, value: u64) -> Self {
        self.hasher.update(b"n");
        self.hasher.update(&value.to_le_bytes());
        self
    }

    pub fn tag(mut self, value: &str) -> Self {
        self.hasher.update(b"t");
        self.hasher.update(&(value.len() as u64).to_le_bytes());
        self.hasher.update(value.as_bytes());
        self
    }

    /// Microsecond precision, matching what the stores persist.
    pub fn instant(mut self, at: &DateTime<Utc>) -> Self {
        self.hasher.update(b"i");
        self.hasher.update(&at.timestamp_micros().to_le_bytes());
        self
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(*self.hasher.finalize().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Point3D;
    use proptest::prelude::*;

    #[test]
    fn test_display_is_hex() {
        let fp = FingerprintBuilder::new("near").meters(1.0).finish();
        let hex = fp.to_string();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp.short().len(), 12);
    }

    #[test]
    fn test_kind_is_part_of_identity() {
        let a = FingerprintBuilder::new("near").meters(5.0).finish();
        let b = FingerprintBuilder::new("bbox").meters(5.0).finish();
        assert_ne!(a, b);
    }

    #[test]
    fn test_snap_rounds_to_nearest_millimeter() {
        assert_eq!(snap(1.0004), 1.0);
        assert_eq!(snap(1.0006), snap(1.001));
        assert_eq!(snap(snap(2.3456)), snap(2.3456));
        assert!(snap(f64::NAN).is_nan());
    }

    proptest! {
        #[test]
        fn snapping_keeps_fingerprint(x in -10_000.0f64..10_000.0) {
            let a = FingerprintBuilder::new("near").meters(x).finish();
            let b = FingerprintBuilder::new("near").meters(snap(x)).finish();
            prop_assert_eq!(a, b);
        }

        #[test]
        fn sub_millimeter_noise_keeps_fingerprint(x in -10_000.0f64..10_000.0, jitter in -0.0001f64..0.0001) {
            let snapped = snap(x);
            let a = FingerprintBuilder::new("near").point(&Point3D::new(snapped, 0.0, 0.0)).finish();
            let b = FingerprintBuilder::new("near").point(&Point3D::new(snapped + jitter, 0.0, 0.0)).finish();
            prop_assert_eq!(a, b);
        }

        #[test]
        fn distinct_millimeters_differ(mm in -1_000_000i64..1_000_000) {
            let a = FingerprintBuilder::new("near").meters(mm as f64 * QUANTUM_METERS).finish();
            let b = FingerprintBuilder::new("near").meters((mm + 1) as f64 * QUANTUM_METERS).finish();
            prop_assert_ne!(a, b);
        }
    }
}

//! Approximate sketch implementations.
//!
//! All sketches hash inputs through md5 so partials computed on different
//! nodes agree bit-for-bit.

pub mod frequency;
pub mod hll;
pub mod quantiles;
pub mod sampling;
pub mod theta;

use basalt_core::Scalar;

/// Stable 64-bit hash of a scalar's canonical byte form.
pub fn hash_scalar(value: &Scalar) -> u64 {
    let bytes = canonical_bytes(value);
    let digest = md5::compute(&bytes);
    u64::from_le_bytes(digest.0[..8].try_into().expect("md5 is 16 bytes"))
}

fn canonical_bytes(value: &Scalar) -> Vec<u8> {
    match value {
        Scalar::Null => Vec::new(),
        Scalar::String(s) => s.as_bytes().to_vec(),
        Scalar::Long(v) => v.to_le_bytes().to_vec(),
        Scalar::Double(v) => v.to_le_bytes().to_vec(),
        Scalar::Float(v) => (*v as f64).to_le_bytes().to_vec(),
        Scalar::Array(items) => {
            let mut out = Vec::new();
            for item in items {
                out.extend(canonical_bytes(item));
                out.push(0xff);
            }
            out
        }
        Scalar::Complex { data, .. } => data.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable_across_calls() {
        let a = hash_scalar(&Scalar::String("basalt".into()));
        let b = hash_scalar(&Scalar::String("basalt".into()));
        assert_eq!(a, b);
        assert_ne!(a, hash_scalar(&Scalar::String("other".into())));
    }
}

//! Pluggable gradient transform applied to the staged host window on the
//! root, just before push and just after pull. Compression numerics live
//! behind this seam; the engine only guarantees the hook points.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::Result;
use crate::reduce::scaled_sum_slice;
use crate::types::{DataType, Key};

pub trait GradientTransform: Send + Sync {
    /// Rewrite the outgoing window in place before it is pushed.
    fn on_push(&self, key: Key, buf: &mut [u8], dtype: DataType) -> Result<()>;

    /// Rewrite the incoming window in place after it was pulled.
    fn on_pull(&self, key: Key, buf: &mut [u8], dtype: DataType) -> Result<()>;
}

/// Pass gradients through untouched.
pub struct IdentityTransform;

impl GradientTransform for IdentityTransform {
    fn on_push(&self, _key: Key, _buf: &mut [u8], _dtype: DataType) -> Result<()> {
        Ok(())
    }

    fn on_pull(&self, _key: Key, _buf: &mut [u8], _dtype: DataType) -> Result<()> {
        Ok(())
    }
}

/// Replace each pushed gradient with its momentum accumulation:
/// `m ← μ·m + g`, push `m`. Pull is untouched.
pub struct MomentumTransform {
    mu: f64,
    state: Mutex<HashMap<Key, Vec<u8>>>,
}

impl MomentumTransform {
    pub fn new(mu: f64) -> Self {
        Self {
            mu,
            state: Mutex::new(HashMap::new()),
        }
    }
}

impl GradientTransform for MomentumTransform {
    fn on_push(&self, key: Key, buf: &mut [u8], dtype: DataType) -> Result<()> {
        let mut state = self.state.lock().expect("momentum state lock");
        let mom = state.entry(key).or_insert_with(|| vec![0u8; buf.len()]);
        // m = g + mu * m, then the window carries m.
        scaled_sum_slice(mom, buf, self.mu, dtype)?;
        buf.copy_from_slice(mom);
        Ok(())
    }

    fn on_pull(&self, _key: Key, _buf: &mut [u8], _dtype: DataType) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32s(vals: &[f32]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn to_f32s(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_identity_is_noop() {
        let t = IdentityTransform;
        let mut buf = f32s(&[1.0, 2.0]);
        let orig = buf.clone();
        t.on_push(1, &mut buf, DataType::F32).unwrap();
        t.on_pull(1, &mut buf, DataType::F32).unwrap();
        assert_eq!(buf, orig);
    }

    #[test]
    fn test_momentum_accumulates_across_rounds() {
        let t = MomentumTransform::new(0.5);
        // Round 1: m = 0.5*0 + 1 = 1
        let mut buf = f32s(&[1.0]);
        t.on_push(7, &mut buf, DataType::F32).unwrap();
        assert_eq!(to_f32s(&buf), vec![1.0]);
        // Round 2: m = 0.5*1 + 1 = 1.5
        let mut buf = f32s(&[1.0]);
        t.on_push(7, &mut buf, DataType::F32).unwrap();
        assert_eq!(to_f32s(&buf), vec![1.5]);
    }

    #[test]
    fn test_momentum_state_is_per_key() {
        let t = MomentumTransform::new(0.9);
        let mut a = f32s(&[2.0]);
        let mut b = f32s(&[3.0]);
        t.on_push(1, &mut a, DataType::F32).unwrap();
        t.on_push(2, &mut b, DataType::F32).unwrap();
        assert_eq!(to_f32s(&a), vec![2.0]);
        assert_eq!(to_f32s(&b), vec![3.0]);
    }

    #[test]
    fn test_momentum_rejects_int_dtypes() {
        let t = MomentumTransform::new(0.9);
        let mut buf = vec![0u8; 4];
        assert!(t.on_push(1, &mut buf, DataType::I32).is_err());
    }
}

//! Constant pool: real (f64), long-string, and SSO interning (§4.1).
//!
//! Reals are deduplicated by exact bit-pattern equality (not `==`, so a
//! pool never merges distinct NaN payloads or treats `-0.0`/`0.0` as
//! the same constant by accident). Long strings dedupe by content. SSO
//! strings are handed to an external, process-wide intern pool in the
//! real runtime; that pool is the GC/object layer, out of scope here,
//! so `SsoPool` is a minimal in-crate stand-in that hands back a stable
//! `SsoRef` handle per distinct string and treats two handles as equal
//! iff they are the same handle — emulating the external pool's
//! pointer-identity contract without depending on it.

use crate::constants::MAX_LITERAL_SIZE;
use rustc_hash::FxHashMap;

/// Opaque handle into the SSO pool; compared by identity only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SsoRef(pub u32);

#[derive(Debug, Default)]
pub struct SsoPool {
    strings: Vec<String>,
    index: FxHashMap<String, u32>,
}

impl SsoPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `s`, returning its stable handle. Assumes the caller has
    /// already verified `s` qualifies for small-string optimisation.
    pub fn intern(&mut self, s: &str) -> Result<SsoRef, PoolError> {
        if let Some(&idx) = self.index.get(s) {
            return Ok(SsoRef(idx));
        }
        if self.strings.len() >= MAX_LITERAL_SIZE {
            return Err(PoolError::TooManyLiterals);
        }
        let idx = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.index.insert(s.to_string(), idx);
        Ok(SsoRef(idx))
    }

    pub fn get(&self, r: SsoRef) -> &str {
        &self.strings[r.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone, Copy)]
pub enum PoolError {
    #[error("constant table exceeds the maximum literal table size")]
    TooManyLiterals,
}

#[derive(Debug, Default)]
pub struct ConstantPool {
    reals: Vec<f64>,
    real_index: FxHashMap<u64, u16>,
    strings: Vec<String>,
    string_index: FxHashMap<String, u16>,
    sso: SsoPool,
}

impl ConstantPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a real constant, deduplicated by exact bit pattern.
    pub fn add_real(&mut self, value: f64) -> Result<u16, PoolError> {
        let bits = value.to_bits();
        if let Some(&idx) = self.real_index.get(&bits) {
            return Ok(idx);
        }
        if self.reals.len() >= MAX_LITERAL_SIZE {
            return Err(PoolError::TooManyLiterals);
        }
        let idx = self.reals.len() as u16;
        self.reals.push(value);
        self.real_index.insert(bits, idx);
        Ok(idx)
    }

    /// Intern a long string, deduplicated by content.
    pub fn add_string(&mut self, value: &str) -> Result<u16, PoolError> {
        if let Some(&idx) = self.string_index.get(value) {
            return Ok(idx);
        }
        if self.strings.len() >= MAX_LITERAL_SIZE {
            return Err(PoolError::TooManyLiterals);
        }
        let idx = self.strings.len() as u16;
        self.strings.push(value.to_string());
        self.string_index.insert(value.to_string(), idx);
        Ok(idx)
    }

    /// Intern a small string via the SSO pool stand-in (identity-compared).
    pub fn add_sso(&mut self, value: &str) -> Result<SsoRef, PoolError> {
        self.sso.intern(value)
    }

    pub fn real(&self, idx: u16) -> Option<f64> {
        self.reals.get(idx as usize).copied()
    }

    pub fn string(&self, idx: u16) -> Option<&str> {
        self.strings.get(idx as usize).map(String::as_str)
    }

    pub fn sso(&self, r: SsoRef) -> &str {
        self.sso.get(r)
    }

    pub fn real_table_size(&self) -> usize {
        self.reals.len()
    }

    pub fn string_table_size(&self) -> usize {
        self.strings.len()
    }

    pub fn sso_table_size(&self) -> usize {
        self.sso.len()
    }

    /// Interned reals in table order, for serialisation (§6 Prototype layout).
    pub fn reals(&self) -> &[f64] {
        &self.reals
    }

    /// Interned long strings in table order, for serialisation.
    pub fn strings(&self) -> &[String] {
        &self.strings
    }

    /// Interned SSO strings in table order, for serialisation.
    pub fn sso_strings(&self) -> &[String] {
        &self.sso.strings
    }

    /// Rebuild a pool from its three tables (module decode). Dedup
    /// indices are reconstructed from content, matching what `add_*`
    /// would have produced had the values been interned in this order.
    pub fn from_parts(reals: Vec<f64>, strings: Vec<String>, sso_strings: Vec<String>) -> Self {
        let mut pool = Self::default();
        for v in reals {
            let idx = pool.reals.len() as u16;
            pool.real_index.insert(v.to_bits(), idx);
            pool.reals.push(v);
        }
        for s in strings {
            let idx = pool.strings.len() as u16;
            pool.string_index.insert(s.clone(), idx);
            pool.strings.push(s);
        }
        for s in sso_strings {
            let idx = pool.sso.strings.len() as u32;
            pool.sso.index.insert(s.clone(), idx);
            pool.sso.strings.push(s);
        }
        pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_dedup_exact_equality() {
        let mut pool = ConstantPool::new();
        let a = pool.add_real(1.5).unwrap();
        let b = pool.add_real(1.5).unwrap();
        let c = pool.add_real(2.5).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pool.real_table_size(), 2);
    }

    #[test]
    fn real_distinguishes_signed_zero() {
        let mut pool = ConstantPool::new();
        let pos = pool.add_real(0.0).unwrap();
        let neg = pool.add_real(-0.0).unwrap();
        assert_ne!(pos, neg);
    }

    #[test]
    fn string_dedup_by_content() {
        let mut pool = ConstantPool::new();
        let a = pool.add_string("hello").unwrap();
        let b = pool.add_string("hello").unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.string(a), Some("hello"));
    }

    #[test]
    fn sso_identity_is_stable_per_distinct_value() {
        let mut pool = ConstantPool::new();
        let a = pool.add_sso("x").unwrap();
        let b = pool.add_sso("x").unwrap();
        let c = pool.add_sso("y").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pool.sso(a), "x");
    }
}

//! The hashinator: consistent hashing of partition-parameter values.
//!
//! The cluster publishes its hash configuration as an opaque varbinary in
//! the topology statistics. The configuration is a token ring: a sorted
//! list of (token, partition) pairs. A value hashes to the partition owning
//! the greatest token at or below its hash, wrapping to the last token.
//!
//! Instances are immutable; the runtime swaps whole instances on topology
//! updates and readers take one snapshot per call.

use bytes::{Buf, Bytes};
use xxhash_rust::xxh64::xxh64;

use crate::params::{ParamType, ParamValue};
use crate::WireError;

const HASH_SEED: u64 = 0;

/// Consistent-hash map from parameter values to partition ids.
#[derive(Debug, Clone)]
pub struct Hashinator {
    /// (token, partition), sorted ascending by token.
    tokens: Vec<(i64, i32)>,
}

impl Hashinator {
    /// Parse a `HASHCONFIG` varbinary: 4-byte token count, then
    /// (8-byte token, 4-byte partition) pairs sorted ascending.
    pub fn from_config(config: &[u8]) -> Result<Hashinator, WireError> {
        let mut buf = Bytes::copy_from_slice(config);
        if buf.remaining() < 4 {
            return Err(WireError::BadHashConfig("short header"));
        }
        let count = buf.get_i32();
        if count <= 0 {
            return Err(WireError::BadHashConfig("no tokens"));
        }
        let count = count as usize;
        if buf.remaining() < count * 12 {
            return Err(WireError::BadHashConfig("short token list"));
        }
        let mut tokens = Vec::with_capacity(count);
        let mut prev: Option<i64> = None;
        for _ in 0..count {
            let token = buf.get_i64();
            let partition = buf.get_i32();
            if let Some(p) = prev {
                if token <= p {
                    return Err(WireError::BadHashConfig("tokens not ascending"));
                }
            }
            prev = Some(token);
            tokens.push((token, partition));
        }
        Ok(Hashinator { tokens })
    }

    /// Serialize a token ring into config bytes. Used by tests and mock
    /// servers; the client itself only parses.
    pub fn config_bytes(tokens: &[(i64, i32)]) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + tokens.len() * 12);
        out.extend_from_slice(&(tokens.len() as i32).to_be_bytes());
        for (token, partition) in tokens {
            out.extend_from_slice(&token.to_be_bytes());
            out.extend_from_slice(&partition.to_be_bytes());
        }
        out
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// Hash a partition-parameter value to its partition id.
    ///
    /// The declared parameter type comes from the procedure catalog; it is
    /// accepted for contract fidelity but the canonical value bytes already
    /// widen integers, so it does not change the outcome.
    pub fn partition_for(&self, _param_type: Option<ParamType>, value: &ParamValue) -> i32 {
        self.partition_for_bytes(&value.hash_bytes())
    }

    fn partition_for_bytes(&self, value_bytes: &[u8]) -> i32 {
        let hash = xxh64(value_bytes, HASH_SEED) as i64;
        // Greatest token <= hash; wrap to the last token below the ring start.
        match self.tokens.binary_search_by_key(&hash, |(t, _)| *t) {
            Ok(idx) => self.tokens[idx].1,
            Err(0) => self.tokens[self.tokens.len() - 1].1,
            Err(idx) => self.tokens[idx - 1].1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring() -> Hashinator {
        // Four evenly spaced tokens over the i64 range.
        let q = i64::MAX / 4;
        Hashinator::from_config(&Hashinator::config_bytes(&[
            (i64::MIN, 0),
            (i64::MIN + q * 2, 1),
            (0, 2),
            (q * 2, 3),
        ]))
        .unwrap()
    }

    #[test]
    fn config_round_trips() {
        let h = ring();
        assert_eq!(h.token_count(), 4);
    }

    #[test]
    fn hashing_is_deterministic() {
        let h = ring();
        let v = ParamValue::I64(12345);
        let p1 = h.partition_for(None, &v);
        let p2 = h.partition_for(Some(ParamType::BigInt), &v);
        assert_eq!(p1, p2);
        assert!((0..4).contains(&p1));
    }

    #[test]
    fn integer_widths_land_on_the_same_partition() {
        let h = ring();
        assert_eq!(
            h.partition_for(None, &ParamValue::I32(777)),
            h.partition_for(None, &ParamValue::I64(777))
        );
    }

    #[test]
    fn values_spread_across_partitions() {
        let h = ring();
        let mut seen = std::collections::HashSet::new();
        for i in 0..256 {
            seen.insert(h.partition_for(None, &ParamValue::I64(i)));
        }
        assert!(seen.len() > 1, "256 keys all hashed to one partition");
    }

    #[test]
    fn malformed_config_is_rejected() {
        assert!(Hashinator::from_config(&[]).is_err());
        assert!(Hashinator::from_config(&0i32.to_be_bytes()).is_err());
        // descending tokens
        let bad = Hashinator::config_bytes(&[(10, 0), (5, 1)]);
        assert!(Hashinator::from_config(&bad).is_err());
    }
}

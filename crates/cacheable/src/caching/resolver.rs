use serde_json::Value;
use sha2::{Digest, Sha256};

use super::arguments::NormalizedArgs;

/// Decides whether two argument tuples denote the same logical request.
///
/// `old` is the tuple of a stored or in-flight call, `new` the tuple of the incoming call. The
/// return value is the sole arbiter of a hit: a resolver may ignore arguments, or route every
/// call carrying some marker argument to whatever is currently cached.
///
/// Resolvers run while the call site's tables are locked, and that lock is not reentrant: a
/// resolver must never call, bust or inspect the [`Memoizer`](super::Memoizer) it is configured
/// on, or the call deadlocks. A panicking resolver is a configuration error and is not recovered
/// from.
pub trait CacheResolver: Send + Sync {
    fn resolve(&self, old: &NormalizedArgs, new: &NormalizedArgs) -> bool;
}

impl<F> CacheResolver for F
where
    F: Fn(&NormalizedArgs, &NormalizedArgs) -> bool + Send + Sync,
{
    fn resolve(&self, old: &NormalizedArgs, new: &NormalizedArgs) -> bool {
        self(old, new)
    }
}

/// Compares the canonical serialization of both tuples.
///
/// Object keys are compared in insertion order, so `{"a":1,"b":2}` and `{"b":2,"a":1}` are
/// different requests. Use [`HashResolver`] to ignore key order.
#[derive(Clone, Copy, Debug, Default)]
pub struct StructuralResolver;

impl CacheResolver for StructuralResolver {
    fn resolve(&self, old: &NormalizedArgs, new: &NormalizedArgs) -> bool {
        old.len() == new.len()
            && serde_json::to_string(old).ok() == serde_json::to_string(new).ok()
    }
}

/// Compares a SHA-256 digest over a key-sorted serialization of both tuples.
#[derive(Clone, Copy, Debug, Default)]
pub struct HashResolver;

impl HashResolver {
    pub fn digest(args: &NormalizedArgs) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for value in args {
            hash_value(&mut hasher, value);
            hasher.update(b",");
        }
        hasher.finalize().into()
    }
}

impl CacheResolver for HashResolver {
    fn resolve(&self, old: &NormalizedArgs, new: &NormalizedArgs) -> bool {
        Self::digest(old) == Self::digest(new)
    }
}

fn hash_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));

            hasher.update(b"{");
            for (key, value) in entries {
                hash_value(hasher, &Value::String(key.clone()));
                hasher.update(b":");
                hash_value(hasher, value);
                hasher.update(b",");
            }
            hasher.update(b"}");
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                hash_value(hasher, item);
                hasher.update(b",");
            }
            hasher.update(b"]");
        }
        scalar => hasher.update(scalar.to_string().as_bytes()),
    }
}

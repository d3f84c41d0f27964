// Fingerprint Generator - content address for a submitted wish history
//
// A submission is identified by its ordered "first pull" markers. Two
// submissions with the same markers in the same order are the same history,
// so the fingerprint doubles as a deduplication key for the ledger.

use serde_json::Value;
use xxhash_rust::xxh64::xxh64;

/// Separator between flattened fields. Matches the canonical serialization:
/// inner sequences are joined with it, and so are the groups themselves,
/// so `[["a","1"],["b","2"]]` flattens to `a;1;b;2`.
const DELIMITER: &str = ";";

/// Deterministic content hash over a submission's identifying pulls.
///
/// Uses seeded xxh64 - fast, fixed-width, and NOT cryptographic. Collision
/// resistance is "good enough to treat equal fingerprint as equal content"
/// at practical re-submission rates, which is all deduplication needs.
/// Changing the seed invalidates every previously stored fingerprint, so the
/// seed is process-wide configuration, injected here rather than read from
/// ambient state.
#[derive(Debug, Clone, Copy)]
pub struct FingerprintGenerator {
    seed: u64,
}

impl FingerprintGenerator {
    pub fn new(seed: u64) -> Self {
        FingerprintGenerator { seed }
    }

    /// Compute the fingerprint for an ordered list of first-pull sequences.
    ///
    /// Identical input (same values, same order) always yields the identical
    /// lowercase hex string for the lifetime of the seed.
    pub fn fingerprint(&self, first_pulls: &[Vec<Value>]) -> String {
        let flattened = first_pulls
            .iter()
            .map(|seq| {
                seq.iter()
                    .map(scalar_text)
                    .collect::<Vec<String>>()
                    .join(DELIMITER)
            })
            .collect::<Vec<String>>()
            .join(DELIMITER);

        format!("{:016x}", xxh64(flattened.as_bytes(), self.seed))
    }
}

/// Render a JSON scalar the way it reads in the payload: strings without
/// quotes, numbers and booleans verbatim. Non-scalars fall back to their
/// JSON text, which is still deterministic.
fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

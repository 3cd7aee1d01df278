//! Stable request fingerprinting for the at-most-once cache discipline.
//!
//! Grounded on `original_source/backend-server/app/model/memcached.py`
//! (`hashed_key`: `sha256(cbor2.dumps(parts))`) generalised to the full
//! tuple spec.md §4.3 specifies:
//! `SHA-256(canonical([prefix, bump, version_egs, [channel, endpoint,
//! panel_bytes, scope, accept]]))`.

use ciborium::value::Value;
use sha2::{Digest, Sha256};

/// A 32-byte opaque cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Inputs to one fingerprint computation (spec.md §4.3's inner tuple).
#[derive(Debug, Clone)]
pub struct FingerprintInput<'a> {
    pub channel_scheme: u32,
    pub channel_value: &'a str,
    pub endpoint: &'a str,
    pub panel_bytes: &'a [u8],
    pub scope: Value,
    pub accept: &'a str,
}

/// Canonicalise a CBOR value: integers already take their smallest form
/// under `ciborium`; maps are re-sorted by their *encoded key bytes*
/// ascending, recursively, matching spec.md §4.3 ("canonicalisation must
/// be stable ... maps ordered by key bytes ascending").
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Map(entries) => {
            let mut canon: Vec<(Value, Value)> = entries
                .iter()
                .map(|(k, v)| (canonicalize(k), canonicalize(v)))
                .collect();
            canon.sort_by(|(ka, _), (kb, _)| encoded_bytes(ka).cmp(&encoded_bytes(kb)));
            Value::Map(canon)
        }
        other => other.clone(),
    }
}

fn encoded_bytes(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).expect("value always encodes");
    buf
}

/// Compute the fingerprint for one cache-eligible request.
///
/// `prefix` already carries the `bump-on-restart` suffix if configured
/// (see [`crate::cache::Bump`]); `bump` is the live salt fetched from the
/// external cache.
pub fn compute(prefix: &str, bump: &str, version_egs: u32, input: &FingerprintInput<'_>) -> Fingerprint {
    let inner = Value::Array(vec![
        Value::Array(vec![
            Value::Integer(input.channel_scheme.into()),
            Value::Text(input.channel_value.to_string()),
        ]),
        Value::Text(input.endpoint.to_string()),
        Value::Bytes(input.panel_bytes.to_vec()),
        input.scope.clone(),
        Value::Text(input.accept.to_string()),
    ]);
    let outer = Value::Array(vec![
        Value::Text(prefix.to_string()),
        Value::Text(bump.to_string()),
        Value::Integer(version_egs.into()),
        inner,
    ]);
    let canonical = canonicalize(&outer);
    let bytes = encoded_bytes(&canonical);

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Fingerprint(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_input() -> FingerprintInput<'static> {
        FingerprintInput {
            channel_scheme: 0,
            channel_value: "u",
            endpoint: "zoomed-seq",
            panel_bytes: b"panel-bytes",
            scope: Value::Map(vec![]),
            accept: "",
        }
    }

    #[test]
    fn identical_inputs_produce_identical_fingerprints() {
        let a = compute("gb", "bump-1", 14, &base_input());
        let b = compute("gb", "bump-1", 14, &base_input());
        assert_eq!(a, b);
    }

    #[test]
    fn changing_any_field_changes_the_fingerprint() {
        let base = compute("gb", "bump-1", 14, &base_input());

        let mut channel_changed = base_input();
        channel_changed.channel_value = "v";
        assert_ne!(base, compute("gb", "bump-1", 14, &channel_changed));

        let mut endpoint_changed = base_input();
        endpoint_changed.endpoint = "gc";
        assert_ne!(base, compute("gb", "bump-1", 14, &endpoint_changed));

        let mut panel_changed = base_input();
        panel_changed.panel_bytes = b"other-panel";
        assert_ne!(base, compute("gb", "bump-1", 14, &panel_changed));

        let mut accept_changed = base_input();
        accept_changed.accept = "uncompressed";
        assert_ne!(base, compute("gb", "bump-1", 14, &accept_changed));

        assert_ne!(base, compute("gb", "bump-2", 14, &base_input()));
        assert_ne!(base, compute("gb", "bump-1", 15, &base_input()));
    }

    #[test]
    fn permuting_scope_map_key_order_does_not_change_fingerprint() {
        let mut forward = base_input();
        forward.scope = Value::Map(vec![
            (Value::Text("genome".into()), Value::Text("hsap".into())),
            (Value::Text("id".into()), Value::Text("ENSG1".into())),
        ]);
        let mut reversed = base_input();
        reversed.scope = Value::Map(vec![
            (Value::Text("id".into()), Value::Text("ENSG1".into())),
            (Value::Text("genome".into()), Value::Text("hsap".into())),
        ]);
        assert_eq!(
            compute("gb", "bump-1", 14, &forward),
            compute("gb", "bump-1", 14, &reversed)
        );
    }
}

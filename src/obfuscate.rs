use sha2::{Digest, Sha256};

/// Scopes that are passed through to the agent verbatim. Everything else is
/// replaced by a short digest token so the agent must discover the failure
/// mode instead of reading it off the label.
pub const TRANSPARENT_SCOPES: [&str; 6] =
    ["error", "unknown", "consistency", "direct", "ordering", "nested"];

/// Returns true if the scope is shown to the agent as-is.
pub fn is_transparent(scope: &str) -> bool {
    TRANSPARENT_SCOPES.contains(&scope)
}

/// Obfuscate a raw scope for the wire.
///
/// Transparent scopes pass through. Any other scope becomes
/// `scope_<first 6 hex of SHA-256(scope)>`. The digest function is committed
/// forever: changing it would re-key every agent-visible scope token across
/// existing runs. Collisions under the 6-hex prefix are tolerated; aggregation
/// happens on raw scopes before this transform, so colliding raw scopes still
/// produce separate violation entries.
pub fn obfuscate_scope(scope: &str) -> String {
    if is_transparent(scope) {
        return scope.to_string();
    }
    format!("scope_{}", short_digest(scope))
}

/// First 6 lowercase hex characters of SHA-256 of the input.
pub fn short_digest(s: &str) -> String {
    let digest = Sha256::digest(s.as_bytes());
    hex::encode(&digest[..3])
}

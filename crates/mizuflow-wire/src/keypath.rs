// Canonical watched-store key layout.
//
// Every flag lives at `/mizuflow/{env}/{namespace}/features/{key}`. Delete
// events from the watched store carry no value, so the identity must be
// recoverable from the key path alone.
use crate::FlagKey;

/// Prefix under which all flags live in the watched store.
pub const FEATURE_ROOT_PREFIX: &str = "/mizuflow/";

/// Builds the canonical storage key for a flag identity.
pub fn feature_key(env: &str, namespace: &str, key: &str) -> String {
    format!("{FEATURE_ROOT_PREFIX}{env}/{namespace}/features/{key}")
}

/// Recovers the flag identity from a canonical storage key.
///
/// Split on `/` the path is `["", "mizuflow", env, namespace, "features", key]`;
/// anything that does not match that shape returns `None`.
pub fn parse_feature_key(full_key: &str) -> Option<FlagKey> {
    let parts: Vec<&str> = full_key.split('/').collect();
    if parts.len() < 6 || parts[1] != "mizuflow" || parts[4] != "features" {
        return None;
    }
    Some(FlagKey::new(parts[3], parts[2], parts[5]))
}

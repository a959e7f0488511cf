// Shared wire and domain types for MizuFlow.
// Everything that travels end-to-end — control plane, watched store, stream,
// SDK — is defined here so every component agrees on one serialized shape.
use serde::{Deserialize, Serialize};

pub mod keypath;
pub mod strategy;

pub use keypath::{feature_key, parse_feature_key, FEATURE_ROOT_PREFIX};
pub use strategy::{FeatureStrategy, Rule};

/// Header carrying the SDK key on snapshot and stream requests.
pub const SDK_KEY_HEADER: &str = "X-Mizu-Key";

/// Identity of a flag: `(namespace, env, key)`.
///
/// Kept separate from `FeatureFlag` so it can be used as a map key and as the
/// identity carried in delete events, where the full object is absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FlagKey {
    pub namespace: String,
    pub env: String,
    pub key: String,
}

impl FlagKey {
    pub fn new(
        namespace: impl Into<String>,
        env: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            env: env.into(),
            key: key.into(),
        }
    }
}

/// How a flag value is interpreted by the SDK evaluator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FlagType {
    Bool,
    String,
    Number,
    Json,
    /// Value is a serialized [`FeatureStrategy`]; evaluated per request.
    Strategy,
}

impl FlagType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagType::Bool => "bool",
            FlagType::String => "string",
            FlagType::Number => "number",
            FlagType::Json => "json",
            FlagType::Strategy => "strategy",
        }
    }
}

impl std::fmt::Display for FlagType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FlagType {
    type Err = UnknownFlagType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bool" => Ok(FlagType::Bool),
            "string" => Ok(FlagType::String),
            "number" => Ok(FlagType::Number),
            "json" => Ok(FlagType::Json),
            "strategy" => Ok(FlagType::Strategy),
            other => Err(UnknownFlagType(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown flag type: {0}")]
pub struct UnknownFlagType(pub String);

/// The payload that travels end-to-end.
///
/// `version` is per-identity and assigned by the write path; `revision` is the
/// global monotone identifier assigned by the watched store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureFlag {
    pub namespace: String,
    pub env: String,
    pub key: String,
    pub value: String,
    #[serde(rename = "type")]
    pub flag_type: FlagType,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub revision: i64,
}

impl FeatureFlag {
    pub fn flag_key(&self) -> FlagKey {
        FlagKey::new(&self.namespace, &self.env, &self.key)
    }
}

/// Mutation kind carried by an [`EventMessage`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Put,
    Delete,
}

/// A single change event as observed from the watched store.
///
/// Within one subscriber connection, delivered revisions are strictly
/// increasing; clients dedupe replay overlap on `revision`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventMessage {
    pub namespace: String,
    pub env: String,
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(rename = "type", default = "default_event_type")]
    pub flag_type: FlagType,
    #[serde(default)]
    pub version: i64,
    pub revision: i64,
    pub action: Action,
}

fn default_event_type() -> FlagType {
    FlagType::String
}

impl EventMessage {
    /// Event for a flag written or updated in the watched store.
    pub fn put(flag: &FeatureFlag, revision: i64) -> Self {
        Self {
            namespace: flag.namespace.clone(),
            env: flag.env.clone(),
            key: flag.key.clone(),
            value: flag.value.clone(),
            flag_type: flag.flag_type,
            version: flag.version,
            revision,
            action: Action::Put,
        }
    }

    /// Event for a flag removed from the watched store. Deletes carry no
    /// payload, so only the identity and revision are populated.
    pub fn delete(key: FlagKey, revision: i64) -> Self {
        Self {
            namespace: key.namespace,
            env: key.env,
            key: key.key,
            value: String::new(),
            flag_type: FlagType::String,
            version: 0,
            revision,
            action: Action::Delete,
        }
    }
}

// Rollout strategy payload for flags of type `strategy`.
//
// The flag value is itself a JSON document: a default value plus an ordered
// rule list. Rules are evaluated in order by the SDK; the first match wins.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureStrategy {
    pub default_value: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// A single targeting rule.
///
/// `operator` is one of `in`, `eq`, or `mod`; `values` carries the operands
/// (the match set for `in`, a single comparand for `eq`, a percentage
/// threshold for `mod`). `result` is returned when the rule matches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    pub attribute: String,
    pub operator: String,
    #[serde(rename = "value")]
    pub values: Vec<String>,
    pub result: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_parses_from_flag_value() {
        let raw = r#"{
            "default_value": "off",
            "rules": [
                {"attribute": "userId", "operator": "mod", "value": ["30"], "result": "on"},
                {"attribute": "country", "operator": "in", "value": ["jp", "de"], "result": "on"}
            ]
        }"#;
        let strategy: FeatureStrategy = serde_json::from_str(raw).expect("parse");
        assert_eq!(strategy.default_value, "off");
        assert_eq!(strategy.rules.len(), 2);
        assert_eq!(strategy.rules[0].operator, "mod");
        assert_eq!(strategy.rules[1].values, vec!["jp", "de"]);
    }

    #[test]
    fn strategy_without_rules_parses() {
        let strategy: FeatureStrategy =
            serde_json::from_str(r#"{"default_value": "off"}"#).expect("parse");
        assert!(strategy.rules.is_empty());
    }
}

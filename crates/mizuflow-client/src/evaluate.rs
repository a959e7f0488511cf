// Flag evaluation: raw values pass through, strategy flags run their rule
// list against the caller's attributes. First matching rule wins.
use mizuflow_wire::{FeatureFlag, FeatureStrategy, FlagType, Rule};
use std::collections::HashMap;

/// Resolves the effective value of a flag for the given attributes.
///
/// Non-strategy flags return their raw value. A strategy flag whose value
/// fails to parse also returns the raw value rather than failing the caller.
pub(crate) fn evaluate_value(flag: &FeatureFlag, attrs: &HashMap<String, String>) -> String {
    if flag.flag_type != FlagType::Strategy {
        return flag.value.clone();
    }
    let strategy: FeatureStrategy = match serde_json::from_str(&flag.value) {
        Ok(strategy) => strategy,
        Err(err) => {
            tracing::warn!(key = %flag.key, error = %err, "strategy value failed to parse");
            return flag.value.clone();
        }
    };
    for rule in &strategy.rules {
        if rule_matches(rule, attrs) {
            return rule.result.clone();
        }
    }
    strategy.default_value
}

fn rule_matches(rule: &Rule, attrs: &HashMap<String, String>) -> bool {
    let Some(value) = attrs.get(&rule.attribute) else {
        return false;
    };
    match rule.operator.as_str() {
        "in" => rule.values.iter().any(|candidate| candidate == value),
        "eq" => rule.values.first().is_some_and(|first| first == value),
        "mod" => {
            // values[0] is a percentage threshold in (0, 100]. Hashing the
            // attribute keeps the verdict stable per user across evaluations
            // and across processes.
            let Some(threshold) = rule.values.first().and_then(|raw| raw.parse::<u32>().ok())
            else {
                return false;
            };
            if threshold == 0 || threshold > 100 {
                return false;
            }
            fnv1a_32(value) % 100 < threshold
        }
        _ => false,
    }
}

/// FNV-1a, 32-bit. Stable across platforms, cheap, and well-distributed
/// enough for percentage bucketing.
fn fnv1a_32(input: &str) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET_BASIS;
    for byte in input.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy_flag(value: &str) -> FeatureFlag {
        FeatureFlag {
            namespace: "default".to_string(),
            env: "dev".to_string(),
            key: "rollout".to_string(),
            value: value.to_string(),
            flag_type: FlagType::Strategy,
            version: 1,
            revision: 1,
        }
    }

    fn attrs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn non_strategy_returns_raw_value() {
        let mut flag = strategy_flag("anything");
        flag.flag_type = FlagType::String;
        assert_eq!(evaluate_value(&flag, &HashMap::new()), "anything");
    }

    #[test]
    fn unparsable_strategy_falls_back_to_raw_value() {
        let flag = strategy_flag("not json");
        assert_eq!(evaluate_value(&flag, &HashMap::new()), "not json");
    }

    #[test]
    fn first_matching_rule_wins() {
        let flag = strategy_flag(
            r#"{"default_value":"off","rules":[
                {"attribute":"country","operator":"eq","value":["jp"],"result":"first"},
                {"attribute":"country","operator":"in","value":["jp","de"],"result":"second"}
            ]}"#,
        );
        assert_eq!(
            evaluate_value(&flag, &attrs(&[("country", "jp")])),
            "first"
        );
        assert_eq!(
            evaluate_value(&flag, &attrs(&[("country", "de")])),
            "second"
        );
        assert_eq!(evaluate_value(&flag, &attrs(&[("country", "us")])), "off");
    }

    #[test]
    fn missing_attribute_never_matches() {
        let rule = Rule {
            attribute: "userId".to_string(),
            operator: "mod".to_string(),
            values: vec!["50".to_string()],
            result: "on".to_string(),
        };
        assert!(!rule_matches(&rule, &HashMap::new()));
    }

    #[test]
    fn mod_rejects_bad_thresholds() {
        for bad in ["0", "101", "abc", "-5"] {
            let rule = Rule {
                attribute: "userId".to_string(),
                operator: "mod".to_string(),
                values: vec![bad.to_string()],
                result: "on".to_string(),
            };
            assert!(
                !rule_matches(&rule, &attrs(&[("userId", "user-1")])),
                "threshold {bad} must not match"
            );
        }
    }

    #[test]
    fn mod_verdict_is_deterministic_per_user() {
        let rule = Rule {
            attribute: "userId".to_string(),
            operator: "mod".to_string(),
            values: vec!["30".to_string()],
            result: "on".to_string(),
        };
        for i in 0..100 {
            let user = attrs(&[("userId", &format!("user-{i}"))]);
            let first = rule_matches(&rule, &user);
            for _ in 0..10 {
                assert_eq!(rule_matches(&rule, &user), first);
            }
        }
    }

    #[test]
    fn mod_hit_rate_tracks_threshold() {
        let rule = Rule {
            attribute: "userId".to_string(),
            operator: "mod".to_string(),
            values: vec!["30".to_string()],
            result: "on".to_string(),
        };
        let total = 10_000;
        let hits = (0..total)
            .filter(|i| rule_matches(&rule, &attrs(&[("userId", &format!("user-{i}"))])))
            .count();
        let rate = hits as f64 / total as f64;
        assert!(
            (rate - 0.30).abs() < 0.025,
            "hit rate {rate} outside 30% +/- 2.5%"
        );
    }

    #[test]
    fn mod_threshold_100_matches_everyone() {
        let rule = Rule {
            attribute: "userId".to_string(),
            operator: "mod".to_string(),
            values: vec!["100".to_string()],
            result: "on".to_string(),
        };
        for i in 0..100 {
            assert!(rule_matches(&rule, &attrs(&[("userId", &format!("user-{i}"))])));
        }
    }

    #[test]
    fn fnv1a_32_matches_reference_vectors() {
        // Standard FNV-1a test vectors.
        assert_eq!(fnv1a_32(""), 0x811c_9dc5);
        assert_eq!(fnv1a_32("a"), 0xe40c_292c);
        assert_eq!(fnv1a_32("foobar"), 0xbf9c_f968);
    }
}

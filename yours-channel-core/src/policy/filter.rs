use crate::prelude::*;
use serde_derive::{Deserialize, Serialize};

/// A result of a filter evaluation
#[derive(Copy, Clone, PartialEq, Debug, Serialize, Deserialize)]
pub enum FilterResult {
    /// Policy should error
    Error,
    /// Policy should warn
    Warn,
}

/// A policy filter rule
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    /// The tag or tag prefix
    pub tag: String,
    /// Whether the tag string should be considered a prefix
    #[serde(default)]
    pub is_prefix: bool,
    /// Whether a policy violation matching this rule should be demoted to a warning
    pub action: FilterResult,
}

/// A policy filter.
/// The default policy is to handle all policies as errors
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyFilter {
    /// The rules, processed in the order they appear in this vector.
    /// The first match stops processing.
    pub rules: Vec<FilterRule>,
}

impl PolicyFilter {
    /// Evaluate the filter rules and return the resulting action
    pub fn filter(&self, tag: impl Into<String>) -> FilterResult {
        let tag = tag.into();
        for rule in self.rules.iter() {
            let matches = if rule.is_prefix { tag.starts_with(&rule.tag) } else { tag == rule.tag };
            if matches {
                return rule.action;
            }
        }
        FilterResult::Error
    }

    /// Create a filter that demotes all policy violations to warnings
    pub fn new_permissive() -> PolicyFilter {
        PolicyFilter {
            rules: vec![FilterRule {
                tag: "".to_string(),
                is_prefix: true,
                action: FilterResult::Warn,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default() {
        assert_eq!(PolicyFilter::default().filter("policy-commitment-fee-range"), FilterResult::Error);
    }

    #[test]
    fn test_warn() {
        let filter = PolicyFilter {
            rules: vec![
                FilterRule {
                    tag: "policy-commitment-fee-range".to_string(),
                    is_prefix: false,
                    action: FilterResult::Warn,
                },
                FilterRule {
                    tag: "policy-payment-".to_string(),
                    is_prefix: true,
                    action: FilterResult::Warn,
                },
            ],
        };
        assert_eq!(filter.filter("policy-commitment-fee-range1"), FilterResult::Error);
        assert_eq!(filter.filter("policy-commitment-fee-range"), FilterResult::Warn);
        assert_eq!(filter.filter("policy-payment-dust"), FilterResult::Warn);
        assert_eq!(filter.filter("policy-commitment-balance"), FilterResult::Error);
    }

    #[test]
    fn test_warn_all() {
        let filter = PolicyFilter::new_permissive();
        assert_eq!(filter.filter("anything"), FilterResult::Warn);
    }

    #[test]
    fn test_from_json() {
        let filter: PolicyFilter = serde_json::from_str(
            r#"{"rules":[{"tag":"policy-payment-","is_prefix":true,"action":"Warn"}]}"#,
        )
        .unwrap();
        assert_eq!(filter.filter("policy-payment-dust"), FilterResult::Warn);
    }
}

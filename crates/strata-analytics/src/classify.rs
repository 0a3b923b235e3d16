//! Bug-fix classification of commit messages.

use regex::Regex;
use serde::{Deserialize, Serialize};
use strata_core::{FixRuleConfig, StrataError};

/// Outcome of classifying one commit message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    /// Whether the commit is a candidate bug fix.
    pub is_fix: bool,
    /// Name of the rule that decided, if any matched.
    pub rule: Option<String>,
}

impl Classification {
    fn no_match() -> Self {
        Self {
            is_fix: false,
            rule: None,
        }
    }
}

/// Strategy deciding whether a commit message describes a bug fix.
pub trait FixClassifier: Send + Sync {
    /// Classify a full commit message.
    fn classify(&self, message: &str) -> Classification;
}

/// What a matching rule decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// The commit is a bug fix.
    Fix,
    /// The commit is not a bug fix, whatever later rules say.
    Ignore,
}

/// One ordered classification rule.
#[derive(Debug, Clone)]
pub struct FixRule {
    /// Rule name.
    pub name: String,
    /// Pattern applied to the full message.
    pub pattern: Regex,
    /// Decision on match.
    pub action: RuleAction,
}

impl FixRule {
    /// Compile a rule.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Config`] for an invalid regex.
    pub fn new(name: &str, pattern: &str, action: RuleAction) -> Result<Self, StrataError> {
        let pattern = Regex::new(pattern)
            .map_err(|e| StrataError::Config(format!("fix rule '{name}': {e}")))?;
        Ok(Self {
            name: name.to_string(),
            pattern,
            action,
        })
    }
}

const DEFAULT_RULES: &[(&str, &str, RuleAction)] = &[
    ("merge", r"^Merge ", RuleAction::Ignore),
    ("revert", r#"^Revert ""#, RuleAction::Ignore),
    (
        "fix-keyword",
        r"(?i)\b(fix(e[sd])?|fixing|bug(fix)?s?|defects?|regressions?|hotfix(es)?|crash(es|ed)?)\b",
        RuleAction::Fix,
    ),
    (
        "issue-close",
        r"(?i)\b(close[sd]?|resolve[sd]?)\s+(#\d+|[A-Z][A-Z0-9]+-\d+)",
        RuleAction::Fix,
    ),
];

/// Ordered list of regex rules; the first matching rule decides.
///
/// # Examples
///
/// ```
/// use strata_analytics::{FixClassifier, PatternClassifier};
///
/// let classifier = PatternClassifier::default();
/// assert!(classifier.classify("Fix null deref in parser").is_fix);
/// assert!(classifier.classify("resolves #42").is_fix);
/// assert!(!classifier.classify("Merge branch 'fix-login'").is_fix);
/// assert!(!classifier.classify("Add prefix option").is_fix);
/// ```
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    rules: Vec<FixRule>,
}

impl PatternClassifier {
    /// Classifier with explicit rules.
    pub fn new(rules: Vec<FixRule>) -> Self {
        Self { rules }
    }

    /// Build from configuration; an empty list selects the built-in rules.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Config`] for an invalid pattern or action.
    pub fn from_config(rules: &[FixRuleConfig]) -> Result<Self, StrataError> {
        if rules.is_empty() {
            return Ok(Self::default());
        }
        let compiled = rules
            .iter()
            .map(|r| {
                let action = match r.action.as_str() {
                    "fix" => RuleAction::Fix,
                    "ignore" => RuleAction::Ignore,
                    other => {
                        return Err(StrataError::Config(format!(
                            "fix rule '{}': unknown action '{other}' (expected 'fix' or 'ignore')",
                            r.name
                        )))
                    }
                };
                FixRule::new(&r.name, &r.pattern, action)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(compiled))
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[FixRule] {
        &self.rules
    }
}

impl Default for PatternClassifier {
    fn default() -> Self {
        let rules = DEFAULT_RULES
            .iter()
            .filter_map(|(name, pattern, action)| FixRule::new(name, pattern, *action).ok())
            .collect();
        Self { rules }
    }
}

impl FixClassifier for PatternClassifier {
    fn classify(&self, message: &str) -> Classification {
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(message))
            .map(|rule| Classification {
                is_fix: rule.action == RuleAction::Fix,
                rule: Some(rule.name.clone()),
            })
            .unwrap_or_else(Classification::no_match)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rules_all_compile() {
        assert_eq!(PatternClassifier::default().rules().len(), DEFAULT_RULES.len());
    }

    #[test]
    fn keyword_variants_match() {
        let c = PatternClassifier::default();
        for msg in [
            "fix: handle empty input",
            "Fixed race in scheduler",
            "bugfix for login",
            "Address regression in 2.1",
            "hotfix: null pointer",
            "prevent crash on exit",
        ] {
            assert!(c.classify(msg).is_fix, "{msg} should be a fix");
        }
    }

    #[test]
    fn words_containing_fix_do_not_match() {
        let c = PatternClassifier::default();
        assert!(!c.classify("Add prefix and suffix options").is_fix);
        assert!(!c.classify("debugger integration").is_fix);
    }

    #[test]
    fn merge_is_ignored_before_keywords() {
        let c = PatternClassifier::default();
        let result = c.classify("Merge pull request #12 from dev/fix-crash");
        assert!(!result.is_fix);
        assert_eq!(result.rule.as_deref(), Some("merge"));
    }

    #[test]
    fn config_rules_replace_defaults_in_order() {
        let rules = vec![
            FixRuleConfig {
                name: "chore".into(),
                pattern: "^chore".into(),
                action: "ignore".into(),
            },
            FixRuleConfig {
                name: "ticket".into(),
                pattern: r"BUG-\d+".into(),
                action: "fix".into(),
            },
        ];
        let c = PatternClassifier::from_config(&rules).unwrap();
        assert!(c.classify("BUG-7 null check").is_fix);
        assert!(!c.classify("chore: BUG-7 bump deps").is_fix);
        assert!(!c.classify("fix typo").is_fix);
    }

    #[test]
    fn unknown_action_is_a_config_error() {
        let rules = vec![FixRuleConfig {
            name: "x".into(),
            pattern: "x".into(),
            action: "maybe".into(),
        }];
        assert!(matches!(
            PatternClassifier::from_config(&rules),
            Err(StrataError::Config(_))
        ));
    }

    #[test]
    fn invalid_regex_is_a_config_error() {
        assert!(FixRule::new("bad", "(", RuleAction::Fix).is_err());
    }
}

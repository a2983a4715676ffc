//! Rule compilation. Patterns compile once, case-insensitive, at engine
//! construction; a malformed pattern is a configuration error, never a
//! request-dispatch failure.

use regex::{Regex, RegexBuilder};

use elida_domain::config::{RuleConfig, RuleTarget};
use elida_domain::error::{Error, Result};
use elida_domain::record::{RuleAction, Severity};

#[derive(Debug)]
pub struct CompiledRule {
    pub name: String,
    pub description: String,
    pub target: RuleTarget,
    pub severity: Severity,
    pub action: RuleAction,
    pub patterns: Vec<Regex>,
}

impl CompiledRule {
    pub fn compile(config: &RuleConfig) -> Result<Self> {
        let mut patterns = Vec::with_capacity(config.patterns.len());
        for raw in &config.patterns {
            let regex = RegexBuilder::new(raw)
                .case_insensitive(true)
                .build()
                .map_err(|e| {
                    Error::Config(format!("rule \"{}\": pattern {raw:?}: {e}", config.name))
                })?;
            patterns.push(regex);
        }
        Ok(Self {
            name: config.name.clone(),
            description: config.description.clone(),
            target: config.target,
            severity: config.severity,
            action: config.action,
            patterns,
        })
    }

    pub fn blocks(&self) -> bool {
        matches!(self.action, RuleAction::Block | RuleAction::Terminate)
    }
}

/// Longest raw pattern length across all rules, used to size the
/// streaming scanner's overlap. A variable-length pattern is covered as
/// long as its minimal match fits; unbounded patterns (`.*`) get a
/// best-effort guarantee over the current scan window only.
pub fn longest_pattern_len(rules: &[RuleConfig]) -> usize {
    rules
        .iter()
        .flat_map(|r| r.patterns.iter())
        .map(|p| p.len())
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use elida_domain::config::RuleKind;

    fn config(patterns: Vec<&str>) -> RuleConfig {
        RuleConfig {
            name: "test".into(),
            description: String::new(),
            kind: RuleKind::ContentMatch,
            target: RuleTarget::Both,
            patterns: patterns.into_iter().map(String::from).collect(),
            severity: Severity::Warning,
            action: RuleAction::Flag,
        }
    }

    #[test]
    fn compiles_case_insensitive() {
        let rule = CompiledRule::compile(&config(vec!["Ignore Previous"])).unwrap();
        assert!(rule.patterns[0].is_match("IGNORE PREVIOUS instructions"));
        assert!(rule.patterns[0].is_match("ignore previous"));
    }

    #[test]
    fn malformed_pattern_fails_compile() {
        let err = CompiledRule::compile(&config(vec!["(unclosed"])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn longest_pattern_measured() {
        let rules = vec![config(vec!["abc", "longest-pattern-here"]), config(vec!["xy"])];
        assert_eq!(longest_pattern_len(&rules), "longest-pattern-here".len());
    }
}

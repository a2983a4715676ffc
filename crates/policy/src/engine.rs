//! The policy engine: per-direction rule evaluation, risk accumulation,
//! progressive enforcement via the risk ladder, and audit mode.

use std::sync::Arc;

use chrono::Utc;

use elida_domain::config::{PolicyConfig, PolicyMode};
use elida_domain::error::Result;
use elida_domain::record::{RuleAction, Violation};
use elida_domain::trace::TraceEvent;

use crate::flagged::FlaggedRegistry;
use crate::ladder::{LadderAction, RiskLadder};
use crate::rules::{longest_pattern_len, CompiledRule};
use crate::scanner::StreamingScanner;

/// Matched-text snippets stored on violations are capped at this many
/// bytes.
const SNIPPET_CAP: usize = 200;

/// Overlap floor when no pattern is longer.
const MIN_OVERLAP: usize = 64;

/// Which side of the proxy the content came from. `Transcript` is the
/// post-session voice scan, which only both-target rules apply to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
    Transcript,
}

/// Outcome of one evaluation.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub violations: Vec<Violation>,
    /// Cumulative session risk score after this evaluation.
    pub risk_score: u32,
    pub ladder_action: LadderAction,
    pub should_block: bool,
    pub should_terminate: bool,
}

impl Evaluation {
    fn clean(risk_score: u32, ladder_action: LadderAction) -> Self {
        Self {
            violations: Vec::new(),
            risk_score,
            ladder_action,
            should_block: false,
            should_terminate: false,
        }
    }

    pub fn has_violations(&self) -> bool {
        !self.violations.is_empty()
    }

    /// Name of the first rule that directed blocking, for the 403 body.
    pub fn blocking_rule(&self) -> Option<&str> {
        self.violations
            .iter()
            .find(|v| matches!(v.action, RuleAction::Block | RuleAction::Terminate))
            .map(|v| v.rule_name.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PolicyEngine {
    enabled: bool,
    mode: PolicyMode,
    rules: Vec<CompiledRule>,
    ladder: RiskLadder,
    flagged: FlaggedRegistry,
    overlap: usize,
    has_blocking_response_rules: bool,
}

impl PolicyEngine {
    /// Compile all rules; any malformed pattern fails construction.
    pub fn new(config: &PolicyConfig, max_captures_per_session: usize) -> Result<Arc<Self>> {
        let rules = config
            .rules
            .iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>>>()?;

        let has_blocking_response_rules = rules
            .iter()
            .any(|r| r.target.includes_response() && r.blocks());

        let overlap = config
            .scan_overlap
            .unwrap_or_else(|| longest_pattern_len(&config.rules).max(MIN_OVERLAP));

        tracing::info!(
            rules = rules.len(),
            mode = ?config.mode,
            overlap,
            blocking_response_rules = has_blocking_response_rules,
            "policy engine ready"
        );

        Ok(Arc::new(Self {
            enabled: config.enabled,
            mode: config.mode,
            rules,
            ladder: RiskLadder::new(&config.risk_ladder),
            flagged: FlaggedRegistry::new(max_captures_per_session),
            overlap,
            has_blocking_response_rules,
        }))
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Precomputed: does any response-targeted rule block or terminate?
    /// The forwarder uses this to choose between streaming pass-through
    /// and incremental scanning.
    pub fn has_blocking_response_rules(&self) -> bool {
        self.has_blocking_response_rules
    }

    pub fn flagged(&self) -> &FlaggedRegistry {
        &self.flagged
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// The ladder action currently in force for a session, for admission
    /// throttling. Audit mode never enforces, so it reports `None`.
    pub fn enforcement_action(&self, session_id: &str) -> LadderAction {
        if self.mode == PolicyMode::Audit {
            return LadderAction::None;
        }
        self.ladder.action_for(self.flagged.score(session_id))
    }

    /// Evaluate `content` against every rule whose target includes
    /// `direction`. Violations update the session's risk score; the
    /// returned enforcement bits reflect both rule actions and the ladder
    /// (and are cleared in audit mode).
    pub fn evaluate(&self, session_id: &str, direction: Direction, content: &str) -> Evaluation {
        self.evaluate_from(session_id, direction, content, 0)
    }

    /// Like [`evaluate`](Self::evaluate), but ignore matches that end at
    /// or before byte offset `new_from` — the streaming scanner passes
    /// the retained-tail length here so re-scanned bytes are not
    /// double-counted.
    pub(crate) fn evaluate_from(
        &self,
        session_id: &str,
        direction: Direction,
        content: &str,
        new_from: usize,
    ) -> Evaluation {
        if !self.enabled || content.is_empty() {
            let score = self.flagged.score(session_id);
            return Evaluation::clean(score, self.ladder.action_for(score));
        }

        let mut violations = Vec::new();
        let mut added_score = 0u32;
        let mut rule_blocks = false;
        let mut rule_terminates = false;
        let now = Utc::now();

        for rule in &self.rules {
            let applies = match direction {
                Direction::Request => rule.target.includes_request(),
                Direction::Response => rule.target.includes_response(),
                Direction::Transcript => {
                    rule.target.includes_request() && rule.target.includes_response()
                }
            };
            if !applies {
                continue;
            }

            let mut matches_this_rule = 0u32;
            for pattern in &rule.patterns {
                for m in pattern.find_iter(content) {
                    if m.end() <= new_from {
                        continue;
                    }
                    matches_this_rule += 1;
                    violations.push(Violation {
                        rule_name: rule.name.clone(),
                        description: rule.description.clone(),
                        severity: rule.severity,
                        matched_text: snippet(m.as_str()),
                        action: rule.action,
                        timestamp: now,
                    });
                }
            }
            if matches_this_rule > 0 {
                added_score += matches_this_rule * rule.severity.weight();
                match rule.action {
                    RuleAction::Terminate => {
                        rule_terminates = true;
                        rule_blocks = true;
                    }
                    RuleAction::Block => rule_blocks = true,
                    RuleAction::Flag => {}
                }
            }
        }

        if violations.is_empty() {
            let score = self.flagged.score(session_id);
            return Evaluation::clean(score, self.ladder.action_for(score));
        }

        let risk_score = self.flagged.record(session_id, &violations, added_score);
        let ladder_action = self.ladder.action_for(risk_score);
        self.flagged.set_action(session_id, ladder_action);

        for v in &violations {
            TraceEvent::PolicyViolation {
                session_id: session_id.to_owned(),
                rule: v.rule_name.clone(),
                severity: v.severity.to_string(),
                action: format!("{:?}", v.action).to_lowercase(),
                risk_score,
            }
            .emit();
        }

        let mut should_block = rule_blocks || ladder_action.blocks();
        let mut should_terminate = rule_terminates || ladder_action.terminates();

        // Audit mode observes but never enforces.
        if self.mode == PolicyMode::Audit {
            should_block = false;
            should_terminate = false;
        }

        Evaluation {
            violations,
            risk_score,
            ladder_action,
            should_block,
            should_terminate,
        }
    }

    /// Per-session streaming scanner over response-direction rules.
    pub fn scanner(self: &Arc<Self>, session_id: &str) -> StreamingScanner {
        StreamingScanner::new(self.clone(), session_id, self.overlap)
    }
}

/// Bounded matched-text snippet, cut on a char boundary.
fn snippet(matched: &str) -> String {
    if matched.len() <= SNIPPET_CAP {
        return matched.to_owned();
    }
    let mut cut = SNIPPET_CAP;
    while cut > 0 && !matched.is_char_boundary(cut) {
        cut -= 1;
    }
    matched[..cut].to_owned()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use elida_domain::config::{RuleConfig, RuleKind, RuleTarget};
    use elida_domain::record::Severity;

    fn rule(name: &str, target: RuleTarget, pattern: &str, severity: Severity, action: RuleAction) -> RuleConfig {
        RuleConfig {
            name: name.into(),
            description: format!("{name} rule"),
            kind: RuleKind::ContentMatch,
            target,
            patterns: vec![pattern.into()],
            severity,
            action,
        }
    }

    fn engine(rules: Vec<RuleConfig>, mode: PolicyMode) -> Arc<PolicyEngine> {
        let config = PolicyConfig {
            rules,
            mode,
            ..Default::default()
        };
        PolicyEngine::new(&config, 100).unwrap()
    }

    #[test]
    fn empty_rules_and_empty_content_are_clean() {
        let e = engine(Vec::new(), PolicyMode::Enforce);
        assert!(!e.evaluate("s1", Direction::Request, "anything").has_violations());
        let e2 = engine(
            vec![rule("r", RuleTarget::Both, "bad", Severity::Warning, RuleAction::Flag)],
            PolicyMode::Enforce,
        );
        assert!(!e2.evaluate("s1", Direction::Request, "").has_violations());
    }

    #[test]
    fn direction_filtering() {
        let e = engine(
            vec![rule("resp-only", RuleTarget::Response, "secret", Severity::Warning, RuleAction::Flag)],
            PolicyMode::Enforce,
        );
        assert!(!e.evaluate("s1", Direction::Request, "secret").has_violations());
        assert!(e.evaluate("s1", Direction::Response, "secret").has_violations());
    }

    #[test]
    fn block_action_sets_should_block() {
        let e = engine(
            vec![rule("blocker", RuleTarget::Request, "<script>", Severity::Critical, RuleAction::Block)],
            PolicyMode::Enforce,
        );
        let eval = e.evaluate("s1", Direction::Request, "x <SCRIPT> y");
        assert!(eval.should_block);
        assert!(!eval.should_terminate);
        assert_eq!(eval.blocking_rule(), Some("blocker"));
    }

    #[test]
    fn terminate_action_sets_both() {
        let e = engine(
            vec![rule("killer", RuleTarget::Request, "rm -rf /", Severity::Critical, RuleAction::Terminate)],
            PolicyMode::Enforce,
        );
        let eval = e.evaluate("s1", Direction::Request, "please run rm -rf /");
        assert!(eval.should_block);
        assert!(eval.should_terminate);
    }

    #[test]
    fn risk_ladder_escalation() {
        // Scenario: warning weight 3, flag action, default thresholds
        // warn@5 / throttle@15 / block@30 / terminate@50.
        let e = engine(
            vec![rule("w", RuleTarget::Request, "match", Severity::Warning, RuleAction::Flag)],
            PolicyMode::Enforce,
        );

        // 3 matches -> score 9 -> warn.
        let eval = e.evaluate("s1", Direction::Request, "match match match");
        assert_eq!(eval.risk_score, 9);
        assert_eq!(eval.ladder_action, LadderAction::Warn);
        assert!(!eval.should_block);

        // 3 more -> 18 -> throttle(10).
        let eval = e.evaluate("s1", Direction::Request, "match match match");
        assert_eq!(eval.risk_score, 18);
        assert_eq!(eval.ladder_action, LadderAction::Throttle { rate_per_minute: 10 });
        assert!(!eval.should_block);

        // 4 more -> 30 -> block.
        let eval = e.evaluate("s1", Direction::Request, "match match match match");
        assert_eq!(eval.risk_score, 30);
        assert_eq!(eval.ladder_action, LadderAction::Block);
        assert!(eval.should_block);
        assert!(!eval.should_terminate);

        // 7 more -> 51 -> terminate.
        let eval = e.evaluate(
            "s1",
            Direction::Request,
            "match match match match match match match",
        );
        assert_eq!(eval.risk_score, 51);
        assert_eq!(eval.ladder_action, LadderAction::Terminate);
        assert!(eval.should_terminate);
    }

    #[test]
    fn audit_mode_records_but_never_enforces() {
        let e = engine(
            vec![rule("blocker", RuleTarget::Request, "bad", Severity::Critical, RuleAction::Terminate)],
            PolicyMode::Audit,
        );
        for _ in 0..10 {
            let eval = e.evaluate("s1", Direction::Request, "bad bad bad");
            assert!(!eval.should_block);
            assert!(!eval.should_terminate);
            assert!(eval.has_violations());
        }
        let flagged = e.flagged().get("s1").unwrap();
        assert_eq!(flagged.violations.len(), 30);
        assert_eq!(flagged.risk_score, 300);
    }

    #[test]
    fn risk_score_is_sum_of_violation_weights() {
        let e = engine(
            vec![
                rule("info", RuleTarget::Both, "aaa", Severity::Info, RuleAction::Flag),
                rule("crit", RuleTarget::Both, "bbb", Severity::Critical, RuleAction::Flag),
            ],
            PolicyMode::Enforce,
        );
        let eval = e.evaluate("s1", Direction::Request, "aaa bbb aaa");
        // 2×info(1) + 1×critical(10) = 12.
        assert_eq!(eval.risk_score, 12);
        let expected: u32 = eval.violations.iter().map(|v| v.severity.weight()).sum();
        assert_eq!(eval.risk_score, expected);
    }

    #[test]
    fn flagged_registry_registers_on_violation() {
        let e = engine(
            vec![rule("w", RuleTarget::Request, "bad", Severity::Warning, RuleAction::Flag)],
            PolicyMode::Enforce,
        );
        assert!(!e.flagged().is_flagged("s1"));
        e.evaluate("s1", Direction::Request, "bad");
        assert!(e.flagged().is_flagged("s1"));
        assert!(!e.flagged().is_flagged("s2"));
    }

    #[test]
    fn has_blocking_response_rules_precomputed() {
        let flag_only = engine(
            vec![rule("w", RuleTarget::Response, "x", Severity::Info, RuleAction::Flag)],
            PolicyMode::Enforce,
        );
        assert!(!flag_only.has_blocking_response_rules());

        let blocking = engine(
            vec![rule("b", RuleTarget::Response, "x", Severity::Info, RuleAction::Block)],
            PolicyMode::Enforce,
        );
        assert!(blocking.has_blocking_response_rules());

        let request_blocking = engine(
            vec![rule("b", RuleTarget::Request, "x", Severity::Info, RuleAction::Block)],
            PolicyMode::Enforce,
        );
        assert!(!request_blocking.has_blocking_response_rules());
    }
}

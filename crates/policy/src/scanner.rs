//! Streaming scanner: evaluates response chunks as they flow, retaining
//! an overlap tail so a pattern straddling a chunk boundary is not
//! missed.
//!
//! Every chunk is evaluated against the window `tail + chunk`, with
//! matches ending inside the retained tail suppressed (they were
//! reported on an earlier call). The overlap must be at least the longest
//! fixed-length pattern; variable-length patterns are covered as long as
//! their minimal match fits, and unbounded patterns (`.*`) get a
//! best-effort guarantee over the current window only.

use std::sync::Arc;

use crate::engine::{Direction, Evaluation, PolicyEngine};

pub struct StreamingScanner {
    engine: Arc<PolicyEngine>,
    session_id: String,
    overlap: usize,
    tail: String,
    total_scanned: u64,
}

impl StreamingScanner {
    pub(crate) fn new(engine: Arc<PolicyEngine>, session_id: &str, overlap: usize) -> Self {
        Self {
            engine,
            session_id: session_id.to_owned(),
            overlap,
            tail: String::new(),
            total_scanned: 0,
        }
    }

    pub fn total_scanned(&self) -> u64 {
        self.total_scanned
    }

    /// Scan one chunk. Returns the evaluation when any rule matched.
    pub fn scan_chunk(&mut self, chunk: &str) -> Option<Evaluation> {
        self.total_scanned += chunk.len() as u64;

        let window = format!("{}{}", self.tail, chunk);
        let new_from = self.tail.len();
        let eval = self
            .engine
            .evaluate_from(&self.session_id, Direction::Response, &window, new_from);

        self.tail = tail_of(&window, self.overlap);

        eval.has_violations().then_some(eval)
    }

    /// One last pass over the residual tail, then release it. Matches
    /// inside the tail were already reported when their window was
    /// scanned, so they are suppressed here; the pass keeps the contract
    /// uniform for scan strategies that defer evaluation.
    pub fn finalize(&mut self) -> Option<Evaluation> {
        let tail = std::mem::take(&mut self.tail);
        let eval =
            self.engine
                .evaluate_from(&self.session_id, Direction::Response, &tail, tail.len());
        eval.has_violations().then_some(eval)
    }

    /// Clear the overlap buffer and the scanned-byte counter.
    pub fn reset(&mut self) {
        self.tail.clear();
        self.total_scanned = 0;
    }
}

/// Last `overlap` bytes of `window`, cut on a char boundary.
fn tail_of(window: &str, overlap: usize) -> String {
    if window.len() <= overlap {
        return window.to_owned();
    }
    let mut start = window.len() - overlap;
    while start < window.len() && !window.is_char_boundary(start) {
        start += 1;
    }
    window[start..].to_owned()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use elida_domain::config::{PolicyConfig, RuleConfig, RuleKind, RuleTarget};
    use elida_domain::record::{RuleAction, Severity};

    fn engine_with(pattern: &str, action: RuleAction, overlap: Option<usize>) -> Arc<PolicyEngine> {
        let config = PolicyConfig {
            rules: vec![RuleConfig {
                name: "stream-rule".into(),
                description: String::new(),
                kind: RuleKind::ContentMatch,
                target: RuleTarget::Response,
                patterns: vec![regex::escape(pattern)],
                severity: Severity::Critical,
                action,
            }],
            scan_overlap: overlap,
            ..Default::default()
        };
        PolicyEngine::new(&config, 100).unwrap()
    }

    #[test]
    fn detects_pattern_across_chunk_boundary() {
        // Scenario: "<script>" split as "prefix <scr" + "ipt>alert",
        // overlap 8. No violation on chunk 1, block on chunk 2.
        let engine = engine_with("<script>", RuleAction::Block, Some(8));
        let mut scanner = engine.scanner("s1");

        assert!(scanner.scan_chunk("prefix <scr").is_none());
        let eval = scanner.scan_chunk("ipt>alert").expect("violation on chunk 2");
        assert!(eval.should_block);
        assert_eq!(eval.violations.len(), 1);
        assert_eq!(eval.violations[0].rule_name, "stream-rule");
    }

    #[test]
    fn detects_pattern_within_single_chunk() {
        let engine = engine_with("<script>", RuleAction::Block, Some(16));
        let mut scanner = engine.scanner("s1");
        assert!(scanner.scan_chunk("x <script> y").is_some());
    }

    #[test]
    fn any_partition_is_caught() {
        // Property: for any split of a text containing the pattern into
        // chunks, some chunk reports the match (pattern len ≤ overlap).
        let text = "leading data <script>alert(1) trailing";
        for split in 1..text.len() {
            if !text.is_char_boundary(split) {
                continue;
            }
            let engine = engine_with("<script>", RuleAction::Block, Some(8));
            let mut scanner = engine.scanner("s1");
            let hit_first = scanner.scan_chunk(&text[..split]).is_some();
            let hit_second = scanner.scan_chunk(&text[split..]).is_some();
            assert!(hit_first || hit_second, "missed at split {split}");
        }
    }

    #[test]
    fn overlap_bytes_not_double_counted() {
        let engine = engine_with("<script>", RuleAction::Flag, Some(32));
        let mut scanner = engine.scanner("s1");
        scanner.scan_chunk("a <script> b");
        // The match sits inside the retained tail; rescanning the window
        // with the next chunk must not report it again.
        assert!(scanner.scan_chunk(" more harmless data").is_none());
        assert_eq!(engine.flagged().get("s1").unwrap().violations.len(), 1);
    }

    #[test]
    fn total_scanned_is_monotonic() {
        let engine = engine_with("x", RuleAction::Flag, Some(8));
        let mut scanner = engine.scanner("s1");
        scanner.scan_chunk("aaaa");
        assert_eq!(scanner.total_scanned(), 4);
        scanner.scan_chunk("bb");
        assert_eq!(scanner.total_scanned(), 6);
        scanner.reset();
        assert_eq!(scanner.total_scanned(), 0);
    }

    #[test]
    fn finalize_quiet_after_full_scan() {
        let engine = engine_with("<script>", RuleAction::Block, Some(8));
        let mut scanner = engine.scanner("s1");
        scanner.scan_chunk("clean data");
        assert!(scanner.finalize().is_none());
    }

    #[test]
    fn reset_clears_overlap() {
        let engine = engine_with("<script>", RuleAction::Block, Some(8));
        let mut scanner = engine.scanner("s1");
        scanner.scan_chunk("half <scr");
        scanner.reset();
        // Without the retained tail the straddling pattern cannot complete.
        assert!(scanner.scan_chunk("ipt> rest").is_none());
    }
}

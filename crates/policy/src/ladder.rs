//! The risk ladder: threshold-indexed mapping from cumulative risk score
//! to enforcement action. The active action is the highest threshold that
//! the score has reached.

use serde::Serialize;

use elida_domain::config::RiskLadderConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum LadderAction {
    None,
    Warn,
    Throttle { rate_per_minute: u32 },
    Block,
    Terminate,
}

impl LadderAction {
    pub fn blocks(self) -> bool {
        matches!(self, LadderAction::Block | LadderAction::Terminate)
    }

    pub fn terminates(self) -> bool {
        matches!(self, LadderAction::Terminate)
    }

    pub fn name(self) -> &'static str {
        match self {
            LadderAction::None => "none",
            LadderAction::Warn => "warn",
            LadderAction::Throttle { .. } => "throttle",
            LadderAction::Block => "block",
            LadderAction::Terminate => "terminate",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RiskLadder {
    /// Ascending (threshold, action) pairs.
    rungs: Vec<(u32, LadderAction)>,
}

impl RiskLadder {
    pub fn new(config: &RiskLadderConfig) -> Self {
        Self {
            rungs: vec![
                (config.warn_at, LadderAction::Warn),
                (
                    config.throttle_at,
                    LadderAction::Throttle {
                        rate_per_minute: config.throttle_rate,
                    },
                ),
                (config.block_at, LadderAction::Block),
                (config.terminate_at, LadderAction::Terminate),
            ],
        }
    }

    /// The highest rung whose threshold the score has reached.
    pub fn action_for(&self, score: u32) -> LadderAction {
        self.rungs
            .iter()
            .rev()
            .find(|(threshold, _)| score >= *threshold)
            .map(|(_, action)| *action)
            .unwrap_or(LadderAction::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ladder() -> RiskLadder {
        RiskLadder::new(&RiskLadderConfig::default())
    }

    #[test]
    fn below_first_rung_is_none() {
        assert_eq!(ladder().action_for(0), LadderAction::None);
        assert_eq!(ladder().action_for(4), LadderAction::None);
    }

    #[test]
    fn escalation_sequence() {
        let l = ladder();
        assert_eq!(l.action_for(5), LadderAction::Warn);
        assert_eq!(l.action_for(9), LadderAction::Warn);
        assert_eq!(l.action_for(15), LadderAction::Throttle { rate_per_minute: 10 });
        assert_eq!(l.action_for(18), LadderAction::Throttle { rate_per_minute: 10 });
        assert_eq!(l.action_for(30), LadderAction::Block);
        assert_eq!(l.action_for(49), LadderAction::Block);
        assert_eq!(l.action_for(51), LadderAction::Terminate);
    }

    #[test]
    fn exact_threshold_selects_that_rung() {
        assert_eq!(ladder().action_for(50), LadderAction::Terminate);
    }
}

//! Policy engine: rule-based evaluation over request and response content,
//! risk-score accumulation driving progressive enforcement, a flagged-
//! session registry, and a streaming scanner that catches patterns across
//! chunk boundaries.

pub mod engine;
pub mod flagged;
pub mod ladder;
pub mod rules;
pub mod scanner;

pub use engine::{Direction, Evaluation, PolicyEngine};
pub use flagged::{FlaggedRegistry, FlaggedSession};
pub use ladder::{LadderAction, RiskLadder};
pub use rules::CompiledRule;
pub use scanner::StreamingScanner;

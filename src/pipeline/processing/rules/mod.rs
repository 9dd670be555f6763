//! Prioritized, condition-gated record rules.

pub mod action;
pub mod condition;
pub mod engine;
pub mod rule;

pub use action::{ActionHandler, FieldValue, LogLevel, RuleAction};
pub use condition::{all_hold, Condition, ConditionOperator};
pub use engine::{RuleEngine, RuleStatistics};
pub use rule::TransformationRule;

use etl_core::{ExecutionContext, ExecutionIssue, Record, Result, ValidationIssue, ValidationResult};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

use super::action::{ActionFlow, RuleAction};
use super::rule::TransformationRule;
use crate::observability::metrics;
use crate::pipeline::processing::transform::{TransformationRegistry, TransformationResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleStatistics {
    pub total_rules: usize,
    pub enabled_rules: usize,
    /// Rule count per priority.
    pub priority_histogram: BTreeMap<i32, usize>,
}

#[derive(Default)]
struct RuleSet {
    inserted: Vec<TransformationRule>,
    ordered: Arc<Vec<TransformationRule>>,
}

impl RuleSet {
    fn reorder(&mut self) {
        let mut ordered = self.inserted.clone();
        // stable: equal priorities keep insertion order
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));
        self.ordered = Arc::new(ordered);
    }
}

/// Applies prioritized rules to records.
///
/// The priority order is rebuilt on every add/remove and published as one
/// snapshot, so a concurrent `apply_rules` sees either the old or the new
/// order, never a mix.
pub struct RuleEngine {
    rules: RwLock<RuleSet>,
    transformations: TransformationRegistry,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new(TransformationRegistry::new())
    }
}

impl RuleEngine {
    pub fn new(transformations: TransformationRegistry) -> Self {
        Self {
            rules: RwLock::new(RuleSet::default()),
            transformations,
        }
    }

    pub fn with_rules(transformations: TransformationRegistry, rules: Vec<TransformationRule>) -> Self {
        let engine = Self::new(transformations);
        for rule in rules {
            engine.add_rule(rule);
        }
        engine
    }

    pub fn add_rule(&self, rule: TransformationRule) {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        debug!(rule_id = %rule.id, priority = rule.priority, "Adding rule");
        rules.inserted.push(rule);
        rules.reorder();
    }

    /// Remove every rule with `rule_id`; returns whether any was removed.
    pub fn remove_rule(&self, rule_id: &str) -> bool {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let before = rules.inserted.len();
        rules.inserted.retain(|rule| rule.id != rule_id);
        let removed = rules.inserted.len() != before;
        if removed {
            rules.reorder();
        }
        removed
    }

    /// Rules by priority descending, then insertion order.
    pub fn rules(&self) -> Arc<Vec<TransformationRule>> {
        Arc::clone(&self.rules.read().unwrap_or_else(PoisonError::into_inner).ordered)
    }

    pub fn transformations(&self) -> &TransformationRegistry {
        &self.transformations
    }

    pub fn validate_rules(&self, ctx: &ExecutionContext) -> ValidationResult {
        let rules = self.rules();
        let schema = ctx.schema();
        let mut result = ValidationResult::new();
        let mut seen = HashSet::new();

        for rule in rules.iter() {
            if !seen.insert(rule.id.as_str()) {
                result.error(format!("duplicate rule id '{}'", rule.id));
            }

            let mut rule_result = rule.validate();
            for action in &rule.actions {
                if let RuleAction::ApplyTransformation { name } = action {
                    if !self.transformations.contains(name) {
                        rule_result.error(format!("unknown transformation '{}'", name));
                    }
                }
            }
            if let Some(schema) = &schema {
                for condition in &rule.conditions {
                    if !schema.contains(&condition.field) {
                        rule_result.add_warning(ValidationIssue::for_field(
                            condition.field.clone(),
                            format!("field not present in schema '{}'", schema.name),
                        ));
                    }
                }
            }
            result.merge_scoped(&format!("rule '{}'", rule.id), rule_result);
        }
        result
    }

    /// Apply every enabled rule in priority order to a copy of `record`.
    ///
    /// A rule whose condition or action fails is rolled back, recorded as a
    /// context error and skipped; later rules still run. The result is
    /// unsuccessful only when every matching rule failed. `Err` means
    /// cancellation.
    pub async fn apply_rules(&self, record: &Record, ctx: &ExecutionContext) -> Result<TransformationResult> {
        let rules = self.rules();
        let mut current = record.clone();
        let mut errors = Vec::new();
        let mut applicable = 0usize;
        let mut failed = 0usize;

        for rule in rules.iter().filter(|rule| rule.enabled) {
            ctx.ensure_not_cancelled()?;

            let outcome = match rule.matches(&current) {
                Ok(false) => continue,
                Ok(true) => self.run_actions(rule, &current, ctx).await,
                Err(e) => Err(e),
            };
            applicable += 1;

            match outcome {
                Ok((updated, flow)) => {
                    current = updated;
                    ctx.append_applied_rule(&rule.id);
                    metrics::rules::applied(&rule.id);
                    debug!(rule_id = %rule.id, "Rule applied");
                    if flow == ActionFlow::Stop {
                        debug!(rule_id = %rule.id, "Rule requested stop");
                        break;
                    }
                }
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    failed += 1;
                    warn!(rule_id = %rule.id, error = %e, "⚠️ Rule failed, continuing with remaining rules");
                    metrics::rules::failed(&rule.id);
                    ctx.add_error(
                        ExecutionIssue::new(format!("rule '{}' failed", rule.id))
                            .with_source(format!("rule:{}", rule.id))
                            .with_detail(&e),
                    );
                    errors.push(format!("rule '{}': {}", rule.id, e));
                }
            }
        }

        let is_successful = applicable == 0 || failed < applicable;
        Ok(TransformationResult::with_errors(is_successful, current, errors))
    }

    async fn run_actions(
        &self,
        rule: &TransformationRule,
        record: &Record,
        ctx: &ExecutionContext,
    ) -> Result<(Record, ActionFlow)> {
        let mut working = record.clone();
        for action in &rule.actions {
            if action.execute(&rule.id, &mut working, ctx, &self.transformations).await? == ActionFlow::Stop {
                return Ok((working, ActionFlow::Stop));
            }
        }
        Ok((working, ActionFlow::Continue))
    }

    pub fn get_statistics(&self) -> RuleStatistics {
        let rules = self.rules();
        let mut priority_histogram = BTreeMap::new();
        for rule in rules.iter() {
            *priority_histogram.entry(rule.priority).or_insert(0) += 1;
        }
        RuleStatistics {
            total_rules: rules.len(),
            enabled_rules: rules.iter().filter(|rule| rule.enabled).count(),
            priority_histogram,
        }
    }
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine")
            .field("rules", &self.rules().len())
            .field("transformations", &self.transformations)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::processing::rules::Condition;
    use etl_core::{DataSchema, EtlError, Value};
    use std::sync::Mutex;

    fn recording_rule(id: &str, priority: i32, seen: Arc<Mutex<Vec<String>>>) -> TransformationRule {
        let rule_id = id.to_string();
        TransformationRule::new(id, id)
            .with_priority(priority)
            .then(RuleAction::custom(id, move |_record, _ctx| {
                seen.lock().unwrap().push(rule_id.clone());
                Ok(())
            }))
    }

    #[tokio::test]
    async fn test_rules_run_by_priority_then_insertion() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let engine = RuleEngine::default();
        engine.add_rule(recording_rule("low", 5, seen.clone()));
        engine.add_rule(recording_rule("first_ten", 10, seen.clone()));
        engine.add_rule(recording_rule("second_ten", 10, seen.clone()));

        let ctx = ExecutionContext::new();
        let result = engine.apply_rules(&Record::new(), &ctx).await.unwrap();
        assert!(result.is_successful);
        assert_eq!(*seen.lock().unwrap(), vec!["first_ten", "second_ten", "low"]);
        assert_eq!(ctx.applied_rule_count("low"), 1);
    }

    #[tokio::test]
    async fn test_failing_rule_is_isolated_and_rolled_back() {
        let engine = RuleEngine::default();
        engine.add_rule(
            TransformationRule::new("a", "throws")
                .with_priority(100)
                .then(RuleAction::set_literal("partial", true))
                .then(RuleAction::custom("boom", |_r, _c| {
                    Err(EtlError::validation("boom"))
                })),
        );
        engine.add_rule(
            TransformationRule::new("b", "sets x")
                .with_priority(50)
                .then(RuleAction::set_literal("x", 1)),
        );

        let ctx = ExecutionContext::new();
        let result = engine.apply_rules(&Record::new(), &ctx).await.unwrap();
        assert!(result.is_successful);
        assert_eq!(result.output.get("x"), Some(&Value::Int(1)));
        assert!(!result.output.contains("partial"));
        assert_eq!(ctx.error_count(), 1);
        assert_eq!(result.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_all_matching_rules_failing_is_unsuccessful() {
        let engine = RuleEngine::default();
        engine.add_rule(
            TransformationRule::new("bad", "bad").then(RuleAction::apply_transformation("missing")),
        );
        let ctx = ExecutionContext::new();
        let result = engine.apply_rules(&Record::new(), &ctx).await.unwrap();
        assert!(!result.is_successful);
    }

    #[tokio::test]
    async fn test_later_rules_see_earlier_mutations_and_stop() {
        let engine = RuleEngine::default();
        engine.add_rule(
            TransformationRule::new("tier", "tier")
                .with_priority(10)
                .when(Condition::greater_than("spend", 100))
                .then(RuleAction::set_literal("tier", "gold")),
        );
        engine.add_rule(
            TransformationRule::new("gold_stop", "stop for gold")
                .with_priority(5)
                .when(Condition::equals("tier", "gold"))
                .then(RuleAction::Stop),
        );
        engine.add_rule(
            TransformationRule::new("never", "after stop")
                .with_priority(1)
                .then(RuleAction::set_literal("late", true)),
        );

        let ctx = ExecutionContext::new();
        let result = engine
            .apply_rules(&Record::new().with_field("spend", 500), &ctx)
            .await
            .unwrap();
        assert_eq!(result.output.get("tier"), Some(&Value::from("gold")));
        assert!(!result.output.contains("late"));
    }

    #[tokio::test]
    async fn test_disabled_and_removed_rules_do_not_run() {
        let engine = RuleEngine::default();
        engine.add_rule(TransformationRule::new("off", "off").disabled().then(RuleAction::set_literal("a", 1)));
        engine.add_rule(TransformationRule::new("gone", "gone").then(RuleAction::set_literal("b", 1)));
        assert!(engine.remove_rule("gone"));
        assert!(!engine.remove_rule("gone"));

        let ctx = ExecutionContext::new();
        let result = engine.apply_rules(&Record::new(), &ctx).await.unwrap();
        assert!(result.output.is_empty());
        assert_eq!(engine.get_statistics().enabled_rules, 0);
    }

    #[test]
    fn test_validate_rules_is_idempotent() {
        let engine = RuleEngine::default();
        engine.add_rule(TransformationRule::new("dup", "one").then(RuleAction::set_literal("a", 1)));
        engine.add_rule(TransformationRule::new("dup", "two").then(RuleAction::apply_transformation("nope")));
        engine.add_rule(
            TransformationRule::new("schema", "schema")
                .when(Condition::equals("unknown_field", 1))
                .then(RuleAction::log("hi")),
        );

        let ctx = ExecutionContext::new();
        ctx.set_schema(DataSchema::infer("input", &Record::new().with_field("a", 1)));
        let first = engine.validate_rules(&ctx);
        let second = engine.validate_rules(&ctx);
        assert_eq!(first, second);
        assert!(!first.is_valid());
        assert_eq!(first.errors().len(), 2);
        assert_eq!(first.warnings().len(), 1);
    }

    #[test]
    fn test_statistics_histogram() {
        let engine = RuleEngine::default();
        for (id, priority) in [("a", 10), ("b", 10), ("c", 5)] {
            engine.add_rule(TransformationRule::new(id, id).with_priority(priority).then(RuleAction::Stop));
        }
        let stats = engine.get_statistics();
        assert_eq!(stats.total_rules, 3);
        assert_eq!(stats.priority_histogram.get(&10), Some(&2));
        assert_eq!(stats.priority_histogram.get(&5), Some(&1));
    }
}

//! 单规则集评估
//!
//! 按 (priority, evaluation_order, id) 顺序执行启用组中的启用规则，
//! 条件树为真即命中，命中规则的调整额为其所有动作之和。

use crate::action::{ActionBreakdown, ActionCalculator};
use crate::context::FieldSource;
use crate::error::Result;
use crate::executor::ConditionExecutor;
use crate::models::{Rule, RuleGroup, Ruleset};
use crate::results::{EvaluationStats, MatchedRule, RulesetEvaluation};
use tracing::{debug, instrument, warn};

/// 规则评估器
#[derive(Debug, Clone, Default)]
pub struct RuleEvaluator {
    executor: ConditionExecutor,
    actions: ActionCalculator,
}

impl RuleEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_actions(actions: ActionCalculator) -> Self {
        Self {
            executor: ConditionExecutor::new(),
            actions,
        }
    }

    /// 在命中规则上附带条件追踪
    pub fn with_trace(mut self) -> Self {
        self.executor = self.executor.with_trace();
        self
    }

    pub fn actions(&self) -> &ActionCalculator {
        &self.actions
    }

    pub fn executor(&self) -> &ConditionExecutor {
        &self.executor
    }

    /// 评估规则集
    ///
    /// 公式运行期错误只让对应动作降级为 0 并记录说明；
    /// 语法或校验错误说明规则本身写错，整个规则集失败。
    #[instrument(skip_all, fields(ruleset_id = ruleset.id, ruleset = %ruleset.name))]
    pub fn evaluate_ruleset<S>(&self, ruleset: &Ruleset, context: &S) -> Result<RulesetEvaluation>
    where
        S: FieldSource + ?Sized,
    {
        let mut rules: Vec<(&RuleGroup, &Rule)> = ruleset
            .rule_groups
            .iter()
            .filter(|group| group.is_active)
            .flat_map(|group| group.rules.iter().map(move |rule| (group, rule)))
            .filter(|(_, rule)| rule.is_active && !rule.is_placeholder())
            .collect();
        rules.sort_by_key(|(_, rule)| rule.sort_key());

        let mut stats = EvaluationStats {
            rulesets_evaluated: 1,
            ..Default::default()
        };
        let mut matched_rules = Vec::new();
        let mut total_adjustment = 0.0;

        for (group, rule) in rules {
            stats.rules_evaluated += 1;

            let evaluation = self.executor.evaluate_traced(&rule.conditions, context);
            if !evaluation.matched {
                continue;
            }

            let matched = self.apply_rule(group, rule, context, &mut stats)?;
            debug!(rule_id = rule.id, rule = %rule.name, adjustment = matched.adjustment, "规则命中");

            total_adjustment += matched.adjustment;
            matched_rules.push(MatchedRule {
                trace: evaluation.trace,
                ..matched
            });
        }

        stats.rules_matched = matched_rules.len();

        Ok(RulesetEvaluation {
            ruleset_id: ruleset.id,
            ruleset_name: ruleset.name.clone(),
            total_adjustment,
            matched_rules,
            stats,
        })
    }

    fn apply_rule<S>(
        &self,
        group: &RuleGroup,
        rule: &Rule,
        context: &S,
        stats: &mut EvaluationStats,
    ) -> Result<MatchedRule>
    where
        S: FieldSource + ?Sized,
    {
        let mut actions = rule.actions.iter().collect::<Vec<_>>();
        actions.sort_by_key(|action| action.display_order);

        let mut breakdowns = Vec::with_capacity(actions.len());
        let mut notes = Vec::new();

        for action in actions {
            match self.actions.calculate_detailed(action, context) {
                Ok(breakdown) => {
                    stats.actions_applied += 1;
                    breakdowns.push(breakdown);
                }
                Err(e) if e.is_runtime() => {
                    warn!(rule_id = rule.id, error = %e, "动作计算失败，按 0 处理");
                    stats.action_failures += 1;
                    notes.push(format!("{} 动作按 0 处理: {}", action.kind.name(), e));
                    breakdowns.push(ActionBreakdown {
                        action_type: action.kind.name().to_string(),
                        base: 0.0,
                        field_multiplier: 1.0,
                        condition_multiplier: 1.0,
                        age_factor: 1.0,
                        brand_multiplier: 1.0,
                        clamped: false,
                        value: 0.0,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        Ok(MatchedRule {
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            group_id: group.id,
            group_name: group.name.clone(),
            priority: rule.priority,
            adjustment: breakdowns.iter().map(|b| b.value).sum(),
            actions: breakdowns,
            notes,
            trace: Vec::new(),
        })
    }
}

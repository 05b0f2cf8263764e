//! 评估结果
//!
//! 每次调用临时生成，由调用方写回商品的估值明细。

use crate::action::ActionBreakdown;
use crate::executor::ConditionTrace;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// 规则集所在层级，按 基线 < 基础 < 高级 的顺序执行
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Baseline,
    Basic,
    Advanced,
}

impl Layer {
    pub const ALL: [Layer; 3] = [Layer::Baseline, Layer::Basic, Layer::Advanced];

    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Baseline => "baseline",
            Layer::Basic => "basic",
            Layer::Advanced => "advanced",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 命中的规则
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedRule {
    pub rule_id: i64,
    pub rule_name: String,
    pub group_id: i64,
    pub group_name: String,
    pub priority: i32,
    /// 该规则所有动作之和
    pub adjustment: f64,
    #[serde(default)]
    pub actions: Vec<ActionBreakdown>,
    /// 降级为 0 的动作说明
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<ConditionTrace>,
}

/// 单次评估的计数，随结果返回而不是放在全局
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationStats {
    pub rulesets_evaluated: usize,
    pub rulesets_failed: usize,
    pub rules_evaluated: usize,
    pub rules_matched: usize,
    pub actions_applied: usize,
    pub action_failures: usize,
}

impl EvaluationStats {
    pub fn merge(&mut self, other: &EvaluationStats) {
        self.rulesets_evaluated += other.rulesets_evaluated;
        self.rulesets_failed += other.rulesets_failed;
        self.rules_evaluated += other.rules_evaluated;
        self.rules_matched += other.rules_matched;
        self.actions_applied += other.actions_applied;
        self.action_failures += other.action_failures;
    }
}

/// 单个规则集的评估结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulesetEvaluation {
    pub ruleset_id: i64,
    pub ruleset_name: String,
    pub total_adjustment: f64,
    pub matched_rules: Vec<MatchedRule>,
    pub stats: EvaluationStats,
}

/// 带层级与来源规则集标记的命中规则
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayeredMatchedRule {
    pub layer: Layer,
    pub ruleset_id: i64,
    pub ruleset_name: String,
    #[serde(flatten)]
    pub rule: MatchedRule,
}

/// 规则集对某一层的贡献
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulesetContribution {
    pub ruleset_id: i64,
    pub name: String,
    pub priority: i32,
    pub adjustment: f64,
    pub matched_rules: usize,
    /// 规则集整体失败时的原因，此时调整额为 0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 单层汇总
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerBreakdown {
    pub layer: Layer,
    pub adjustment: f64,
    pub rulesets: Vec<RulesetContribution>,
}

/// 商品估值结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<i64>,
    pub base_price: f64,
    pub total_adjustment: f64,
    pub adjusted_price: f64,
    pub matched_rules: Vec<LayeredMatchedRule>,
    pub layers: Vec<LayerBreakdown>,
    pub stats: EvaluationStats,
    pub evaluated_at: DateTime<Utc>,
}

impl EvaluationResult {
    pub fn empty(base_price: f64) -> Self {
        Self {
            item_id: None,
            base_price,
            total_adjustment: 0.0,
            adjusted_price: base_price,
            matched_rules: Vec::new(),
            layers: Vec::new(),
            stats: EvaluationStats::default(),
            evaluated_at: Utc::now(),
        }
    }

    pub fn layer(&self, layer: Layer) -> Option<&LayerBreakdown> {
        self.layers.iter().find(|l| l.layer == layer)
    }

    /// 写回商品的估值明细
    pub fn breakdown_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_ordering() {
        assert!(Layer::Baseline < Layer::Basic);
        assert!(Layer::Basic < Layer::Advanced);
        assert_eq!(serde_json::to_value(Layer::Advanced).unwrap(), "advanced");
    }

    #[test]
    fn test_layered_rule_flattens() {
        let rule = LayeredMatchedRule {
            layer: Layer::Basic,
            ruleset_id: 2,
            ruleset_name: "Basic".into(),
            rule: MatchedRule {
                rule_id: 10,
                rule_name: "RAM bonus".into(),
                group_id: 1,
                group_name: "Memory".into(),
                priority: 100,
                adjustment: 25.0,
                actions: Vec::new(),
                notes: Vec::new(),
                trace: Vec::new(),
            },
        };

        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["layer"], "basic");
        assert_eq!(json["rule_name"], "RAM bonus");
        assert!(json.get("notes").is_none());
    }

    #[test]
    fn test_stats_merge() {
        let mut total = EvaluationStats::default();
        total.merge(&EvaluationStats {
            rules_evaluated: 3,
            rules_matched: 1,
            ..Default::default()
        });
        total.merge(&EvaluationStats {
            rules_evaluated: 2,
            ..Default::default()
        });
        assert_eq!(total.rules_evaluated, 5);
        assert_eq!(total.rules_matched, 1);
    }
}

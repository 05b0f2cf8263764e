//! 多层规则集评估
//!
//! 选出适用于商品的规则集，按 基线 → 基础 → 高级 的层级顺序逐个评估，
//! 汇总出总调整额和分层明细。单个规则集失败不会影响其他规则集。

use crate::action::ActionCalculator;
use crate::context::FieldSource;
use crate::executor::ConditionExecutor;
use crate::expression::{FormulaEngine, FormulaLimits};
use crate::models::Ruleset;
use crate::results::{
    EvaluationResult, EvaluationStats, Layer, LayerBreakdown, LayeredMatchedRule,
    RulesetContribution, RulesetEvaluation,
};
use crate::rule_evaluator::RuleEvaluator;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use valuation_shared::config::{EngineConfig, LayerSettings};

/// 层级划分阈值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    /// 优先级不超过该值的规则集属于基线层
    pub baseline_max_priority: i32,
    /// 优先级不超过该值的规则集属于基础层，更高的属于高级层
    pub basic_max_priority: i32,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            baseline_max_priority: 5,
            basic_max_priority: 10,
        }
    }
}

impl From<&LayerSettings> for LayerConfig {
    fn from(settings: &LayerSettings) -> Self {
        Self {
            baseline_max_priority: settings.baseline_max_priority,
            basic_max_priority: settings.basic_max_priority,
        }
    }
}

impl LayerConfig {
    /// 元数据显式标记优先，否则按优先级区间划分
    pub fn classify(&self, ruleset: &Ruleset) -> Layer {
        if ruleset.is_system_baseline() || ruleset.priority <= self.baseline_max_priority {
            Layer::Baseline
        } else if ruleset.priority <= self.basic_max_priority {
            Layer::Basic
        } else {
            Layer::Advanced
        }
    }
}

/// 多层评估器
#[derive(Debug, Clone, Default)]
pub struct LayeredEvaluator {
    config: LayerConfig,
    rules: RuleEvaluator,
}

impl LayeredEvaluator {
    pub fn new(config: LayerConfig) -> Self {
        Self {
            config,
            rules: RuleEvaluator::new(),
        }
    }

    pub fn with_rule_evaluator(config: LayerConfig, rules: RuleEvaluator) -> Self {
        Self { config, rules }
    }

    /// 按部署配置构建，层级阈值、公式限制和轨迹开关都来自 `engine` 配置段
    pub fn from_config(config: &EngineConfig) -> Self {
        let limits = FormulaLimits {
            max_depth: config.formula.max_depth,
            warn_depth: config.formula.warn_depth,
        };
        let formulas = FormulaEngine::with_limits(limits).with_cache_capacity(config.formula.cache_capacity);
        let mut rules = RuleEvaluator::with_actions(ActionCalculator::with_engine(Arc::new(formulas)));
        if config.trace {
            rules = rules.with_trace();
        }
        Self::with_rule_evaluator(LayerConfig::from(&config.layers), rules)
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    pub fn rule_evaluator(&self) -> &RuleEvaluator {
        &self.rules
    }

    /// 选出适用的规则集并排序
    ///
    /// 去掉停用的、被显式排除的、激活条件不满足的规则集，
    /// 按 (层级, 优先级, 创建时间) 排序。
    pub fn select<'a, S>(
        &self,
        rulesets: &'a [Ruleset],
        exclude_ids: &[i64],
        context: &S,
    ) -> Vec<(Layer, &'a Ruleset)>
    where
        S: FieldSource + ?Sized,
    {
        let executor = ConditionExecutor::new();
        let mut selected: Vec<(Layer, &Ruleset)> = rulesets
            .iter()
            .filter(|ruleset| ruleset.is_active)
            .filter(|ruleset| !exclude_ids.contains(&ruleset.id))
            .filter(|ruleset| {
                let applies = executor.evaluate(&ruleset.conditions, context);
                if !applies {
                    debug!(ruleset_id = ruleset.id, "激活条件不满足，跳过规则集");
                }
                applies
            })
            .map(|ruleset| (self.config.classify(ruleset), ruleset))
            .collect();

        selected.sort_by(|(la, a), (lb, b)| {
            la.cmp(lb)
                .then(a.priority.cmp(&b.priority))
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        selected
    }

    /// 多层评估
    #[instrument(skip(self, rulesets, context), fields(candidates = rulesets.len()))]
    pub fn evaluate<S>(
        &self,
        rulesets: &[Ruleset],
        exclude_ids: &[i64],
        base_price: f64,
        context: &S,
    ) -> EvaluationResult
    where
        S: FieldSource + ?Sized,
    {
        let selected = self.select(rulesets, exclude_ids, context);
        self.run(selected, base_price, context)
    }

    /// 单规则集模式：跳过选择与激活条件，只评估指定规则集
    ///
    /// 得到的调整额与该规则集在多层评估中的贡献一致。
    pub fn evaluate_single<S>(&self, ruleset: &Ruleset, base_price: f64, context: &S) -> EvaluationResult
    where
        S: FieldSource + ?Sized,
    {
        let layer = self.config.classify(ruleset);
        self.run(vec![(layer, ruleset)], base_price, context)
    }

    fn run<S>(&self, selected: Vec<(Layer, &Ruleset)>, base_price: f64, context: &S) -> EvaluationResult
    where
        S: FieldSource + ?Sized,
    {
        let mut result = EvaluationResult::empty(base_price);

        for (layer, ruleset) in selected {
            let outcome = self.rules.evaluate_ruleset(ruleset, context);
            let contribution = match outcome {
                Ok(evaluation) => self.accumulate(&mut result, layer, ruleset, evaluation),
                Err(e) => {
                    warn!(ruleset_id = ruleset.id, error = %e, "规则集评估失败，调整额按 0 处理");
                    result.stats.merge(&EvaluationStats {
                        rulesets_evaluated: 1,
                        rulesets_failed: 1,
                        ..Default::default()
                    });
                    RulesetContribution {
                        ruleset_id: ruleset.id,
                        name: ruleset.name.clone(),
                        priority: ruleset.priority,
                        adjustment: 0.0,
                        matched_rules: 0,
                        error: Some(e.to_string()),
                    }
                }
            };

            let index = match result.layers.iter().position(|b| b.layer == layer) {
                Some(index) => index,
                None => {
                    result.layers.push(LayerBreakdown {
                        layer,
                        adjustment: 0.0,
                        rulesets: Vec::new(),
                    });
                    result.layers.len() - 1
                }
            };
            let breakdown = &mut result.layers[index];
            breakdown.adjustment += contribution.adjustment;
            breakdown.rulesets.push(contribution);
        }

        result.total_adjustment = result.layers.iter().map(|l| l.adjustment).sum();
        result.adjusted_price = base_price + result.total_adjustment;
        result.evaluated_at = Utc::now();

        info!(
            total_adjustment = result.total_adjustment,
            matched = result.matched_rules.len(),
            "估值完成"
        );
        result
    }

    fn accumulate(
        &self,
        result: &mut EvaluationResult,
        layer: Layer,
        ruleset: &Ruleset,
        evaluation: RulesetEvaluation,
    ) -> RulesetContribution {
        result.stats.merge(&evaluation.stats);

        let contribution = RulesetContribution {
            ruleset_id: ruleset.id,
            name: ruleset.name.clone(),
            priority: ruleset.priority,
            adjustment: evaluation.total_adjustment,
            matched_rules: evaluation.matched_rules.len(),
            error: None,
        };

        result
            .matched_rules
            .extend(evaluation.matched_rules.into_iter().map(|rule| LayeredMatchedRule {
                layer,
                ruleset_id: ruleset.id,
                ruleset_name: ruleset.name.clone(),
                rule,
            }));

        contribution
    }
}

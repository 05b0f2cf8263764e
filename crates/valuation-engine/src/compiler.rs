//! 规则集编译器
//!
//! 编写期对规则集做静态校验，并预先提取评估所需的全部字段。

use crate::action::ActionCalculator;
use crate::conditions::{ConditionLeaf, ConditionTree};
use crate::error::{Result, RuleError};
use crate::evaluator::ConditionEvaluator;
use crate::models::{Rule, Ruleset};
use crate::operators::Operator;
use std::collections::BTreeSet;

/// 编译后的规则集
#[derive(Debug, Clone)]
pub struct CompiledRuleset {
    pub ruleset: Ruleset,
    /// 规则集中使用的所有字段路径
    pub required_fields: BTreeSet<String>,
    /// 编译版本号（用于缓存失效）
    pub compile_version: u64,
}

impl CompiledRuleset {
    pub fn id(&self) -> i64 {
        self.ruleset.id
    }

    pub fn name(&self) -> &str {
        &self.ruleset.name
    }
}

/// 规则集编译器
#[derive(Debug, Default)]
pub struct RulesetCompiler {
    compile_version: u64,
    actions: ActionCalculator,
}

impl RulesetCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_actions(actions: ActionCalculator) -> Self {
        Self {
            compile_version: 0,
            actions,
        }
    }

    /// 从 JSON 字符串编译规则集
    pub fn compile_from_json(&mut self, json: &str) -> Result<CompiledRuleset> {
        let ruleset: Ruleset = serde_json::from_str(json)?;
        self.compile(ruleset)
    }

    /// 编译规则集
    pub fn compile(&mut self, ruleset: Ruleset) -> Result<CompiledRuleset> {
        self.validate_ruleset(&ruleset)?;

        let required_fields = self.extract_fields(&ruleset);
        self.compile_version += 1;

        Ok(CompiledRuleset {
            ruleset,
            required_fields,
            compile_version: self.compile_version,
        })
    }

    /// 校验规则集结构
    pub fn validate_ruleset(&self, ruleset: &Ruleset) -> Result<()> {
        if ruleset.name.trim().is_empty() {
            return Err(RuleError::validation("规则集名称不能为空"));
        }

        validate_tree(&ruleset.conditions, "activation")?;

        for group in &ruleset.rule_groups {
            if group.name.trim().is_empty() {
                return Err(RuleError::validation(format!(
                    "规则集 '{}' 中存在未命名的规则组",
                    ruleset.name
                )));
            }
            if !(0.0..=1.0).contains(&group.weight) {
                return Err(RuleError::validation(format!(
                    "规则组 '{}' 的权重 {} 超出 [0, 1]",
                    group.name, group.weight
                )));
            }

            for rule in &group.rules {
                self.validate_rule(rule, &format!("{}.{}", group.name, rule.name))?;
            }
        }

        Ok(())
    }

    /// 校验单条规则的条件和动作
    pub fn validate_rule(&self, rule: &Rule, path: &str) -> Result<()> {
        if rule.name.trim().is_empty() {
            return Err(RuleError::validation(format!("规则 '{}' 的名称不能为空", path)));
        }

        validate_tree(&rule.conditions, path)?;

        for (i, action) in rule.actions.iter().enumerate() {
            self.actions.validate(action).map_err(|e| match e {
                RuleError::InvalidAction(message) => {
                    RuleError::InvalidAction(format!("{}.actions[{}]: {}", path, i, message))
                }
                other => other,
            })?;
        }

        Ok(())
    }

    /// 提取规则集中使用的所有字段
    pub fn extract_fields(&self, ruleset: &Ruleset) -> BTreeSet<String> {
        let mut fields: BTreeSet<String> = ruleset
            .conditions
            .leaves()
            .into_iter()
            .map(|leaf| leaf.field_name.clone())
            .collect();

        for (_, rule) in ruleset.rules() {
            fields.extend(rule.conditions.leaves().into_iter().map(|l| l.field_name.clone()));
            for action in &rule.actions {
                fields.extend(action.referenced_fields(self.actions.formulas()));
            }
        }

        fields
    }
}

/// 校验条件树中每个叶子的操作符与期望值是否匹配
pub fn validate_tree(tree: &ConditionTree, path: &str) -> Result<()> {
    for leaf in tree.leaves() {
        validate_leaf(leaf, path)?;
    }
    Ok(())
}

fn validate_leaf(leaf: &ConditionLeaf, path: &str) -> Result<()> {
    if leaf.field_name.trim().is_empty() {
        return Err(RuleError::InvalidCondition(format!(
            "条件 '{}' 的字段不能为空",
            path
        )));
    }

    match leaf.operator {
        Operator::Between => {
            let (min, max) = ConditionEvaluator::bounds(&leaf.value).map_err(|_| {
                RuleError::InvalidCondition(format!(
                    "条件 '{}' 的 between 操作符需要 [min, max] 数组",
                    path
                ))
            })?;
            if min > max {
                return Err(RuleError::InvalidCondition(format!(
                    "条件 '{}' 的 between 下界 {} 大于上界 {}",
                    path, min, max
                )));
            }
        }
        Operator::In | Operator::NotIn => {
            if !leaf.value.is_array() {
                return Err(RuleError::InvalidCondition(format!(
                    "条件 '{}' 的 {} 操作符需要数组值",
                    path, leaf.operator
                )));
            }
        }
        Operator::Regex => {
            let Some(pattern) = leaf.value.as_str() else {
                return Err(RuleError::InvalidCondition(format!(
                    "条件 '{}' 的 regex 操作符需要字符串值",
                    path
                )));
            };
            ConditionEvaluator::compiled_regex(pattern).map_err(|e| {
                RuleError::InvalidCondition(format!("条件 '{}' 的正则表达式无效: {}", path, e))
            })?;
        }
        _ => {}
    }

    Ok(())
}

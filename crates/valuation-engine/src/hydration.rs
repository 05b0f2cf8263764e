//! 占位规则展开
//!
//! 占位规则的元数据形如
//! `{"placeholder": true, "hydration": {"field": "ram_type", "values": {"DDR5": 20, "DDR3": -15}}}`，
//! 展开后每个取值对应一条 `equals` 条件加 `fixed_value` 动作的具体规则。

use crate::action::Action;
use crate::conditions::{ConditionLeaf, ConditionTree};
use crate::error::{Result, RuleError};
use crate::models::{HYDRATION_KEY, HYDRATION_SOURCE_KEY, Rule, RuleGroup};
use crate::operators::Operator;
use serde::Deserialize;
use serde_json::{Map, Value};

/// 展开参数
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HydrationSpec {
    pub field: String,
    /// 取值到调整金额（美元）的映射
    pub values: Map<String, Value>,
}

impl HydrationSpec {
    /// 从占位规则的元数据中读取展开参数
    pub fn from_rule(rule: &Rule) -> Result<Self> {
        let raw = rule.metadata.get(HYDRATION_KEY).ok_or_else(|| {
            RuleError::validation(format!("占位规则 '{}' 缺少 hydration 元数据", rule.name))
        })?;
        let spec: HydrationSpec = serde_json::from_value(raw.clone())?;

        if spec.field.trim().is_empty() {
            return Err(RuleError::validation(format!(
                "占位规则 '{}' 的展开字段不能为空",
                rule.name
            )));
        }
        Ok(spec)
    }
}

/// 展开单条占位规则
///
/// 生成的规则继承占位规则的优先级与分组，按取值的字典序排列执行顺序。
/// 非占位规则原样返回空列表。
pub fn hydrate_rule(placeholder: &Rule) -> Result<Vec<Rule>> {
    if !placeholder.is_placeholder() {
        return Ok(Vec::new());
    }

    let spec = HydrationSpec::from_rule(placeholder)?;
    let mut rules = Vec::with_capacity(spec.values.len());

    for (order, (value, adjustment)) in spec.values.iter().enumerate() {
        let amount = adjustment.as_f64().ok_or_else(|| {
            RuleError::InvalidAction(format!(
                "占位规则 '{}' 中取值 '{}' 的调整金额不是数字",
                placeholder.name, value
            ))
        })?;

        let mut rule = Rule::new(format!("{}: {}", placeholder.name, value))
            .with_priority(placeholder.priority)
            .with_conditions(ConditionTree::leaf(ConditionLeaf::new(
                spec.field.clone(),
                Operator::Equals,
                value.clone(),
            )))
            .with_action(Action::fixed(amount))
            .with_metadata(HYDRATION_SOURCE_KEY, placeholder.id);
        rule.group_id = placeholder.group_id;
        rule.evaluation_order = placeholder.evaluation_order + order as i32;
        rule.description = placeholder.description.clone();
        rules.push(rule);
    }

    Ok(rules)
}

/// 展开报告
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HydrationReport {
    /// 被停用的占位规则名
    pub placeholders: Vec<String>,
    pub created: usize,
}

/// 展开规则组中所有启用的占位规则
///
/// 新规则追加到组尾，占位规则随后被停用，重复调用不会再次展开。
pub fn hydrate_group(group: &mut RuleGroup) -> Result<HydrationReport> {
    let mut report = HydrationReport::default();
    let mut hydrated = Vec::new();

    for rule in group.rules.iter().filter(|r| r.is_active && r.is_placeholder()) {
        hydrated.extend(hydrate_rule(rule)?);
        report.placeholders.push(rule.name.clone());
    }

    for rule in group.rules.iter_mut() {
        if rule.is_active && rule.is_placeholder() {
            rule.is_active = false;
        }
    }

    report.created = hydrated.len();
    group.rules.extend(hydrated);
    Ok(report)
}

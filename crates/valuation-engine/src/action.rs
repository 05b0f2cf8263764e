//! 动作计算
//!
//! 规则命中后由动作产生美元调整额：先计算基础值，再按固定顺序叠乘修正系数
//! （字段 → 成色 → 折旧 → 品牌），最后按需裁剪到区间内。

use crate::context::{FieldSource, resolve};
use crate::error::{Result, RuleError};
use crate::evaluator::ConditionEvaluator;
use crate::expression::FormulaEngine;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// 跑分类动作的固定除数
pub const BENCHMARK_DIVISOR: f64 = 1000.0;

/// 默认读取的商品字段
pub const CONDITION_FIELD: &str = "condition";
pub const AGE_FIELD: &str = "age_years";
pub const BRAND_FIELD: &str = "manufacturer";

/// 动作类型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action_type", rename_all = "snake_case")]
pub enum ActionKind {
    /// 固定金额
    FixedValue { value_usd: f64 },
    /// 单价乘以上下文中的数量
    PerUnit { value_usd: f64, metric: String },
    /// 沙箱公式
    Formula { formula: String },
    /// 单价乘以跑分再除以 1000
    BenchmarkBased { value_usd: f64, metric: String },
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FixedValue { .. } => "fixed_value",
            Self::PerUnit { .. } => "per_unit",
            Self::Formula { .. } => "formula",
            Self::BenchmarkBased { .. } => "benchmark_based",
        }
    }
}

/// 规则动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(flatten)]
    pub kind: ActionKind,
    #[serde(default)]
    pub modifiers: Modifiers,
    #[serde(default)]
    pub display_order: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            modifiers: Modifiers::default(),
            display_order: 0,
            description: None,
        }
    }

    pub fn fixed(value_usd: f64) -> Self {
        Self::new(ActionKind::FixedValue { value_usd })
    }

    pub fn per_unit(value_usd: f64, metric: impl Into<String>) -> Self {
        Self::new(ActionKind::PerUnit {
            value_usd,
            metric: metric.into(),
        })
    }

    pub fn formula(formula: impl Into<String>) -> Self {
        Self::new(ActionKind::Formula {
            formula: formula.into(),
        })
    }

    pub fn benchmark(value_usd: f64, metric: impl Into<String>) -> Self {
        Self::new(ActionKind::BenchmarkBased {
            value_usd,
            metric: metric.into(),
        })
    }

    pub fn with_modifiers(mut self, modifiers: Modifiers) -> Self {
        self.modifiers = modifiers;
        self
    }

    /// 动作中引用的上下文字段
    pub fn referenced_fields(&self, formulas: &FormulaEngine) -> Vec<String> {
        let mut fields = match &self.kind {
            ActionKind::FixedValue { .. } => Vec::new(),
            ActionKind::PerUnit { metric, .. } | ActionKind::BenchmarkBased { metric, .. } => {
                vec![metric.clone()]
            }
            ActionKind::Formula { formula } => formulas
                .parse(formula)
                .map(|expr| expr.referenced_fields().into_iter().collect())
                .unwrap_or_default(),
        };
        fields.extend(self.modifiers.referenced_fields());
        fields
    }
}

/// 字段取值对应的系数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiplierCase {
    pub value: Value,
    pub multiplier: f64,
}

/// 按字段取值选择系数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMultiplier {
    pub field: String,
    pub conditions: Vec<MultiplierCase>,
}

/// 线性折旧曲线
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgeCurve {
    pub rate_per_year: f64,
    pub max_depreciation: f64,
    /// 读取年限的字段，默认 `age_years`
    #[serde(default = "default_age_field")]
    pub field: String,
}

fn default_age_field() -> String {
    AGE_FIELD.to_string()
}

impl AgeCurve {
    /// `max(1 - rate × age, 1 - max_depreciation)`
    pub fn factor(&self, age_years: f64) -> f64 {
        let age = age_years.max(0.0);
        (1.0 - self.rate_per_year * age).max(1.0 - self.max_depreciation)
    }
}

/// 修正系数集合
///
/// 反序列化是宽松的：任何缺失或格式错误的部分都按“无修正”处理，不会报错。
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Modifiers {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub field_multipliers: Vec<FieldMultiplier>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub condition_multipliers: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_curve: Option<AgeCurve>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub brand_multipliers: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub clamp: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_usd: Option<f64>,
}

impl<'de> Deserialize<'de> for Modifiers {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(Self::from_value(&value))
    }
}

impl Modifiers {
    /// 从任意 JSON 构造，无法识别的结构直接忽略
    pub fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::default();
        };

        Self {
            field_multipliers: obj
                .get("field_multipliers")
                .and_then(Value::as_array)
                .map(|entries| entries.iter().filter_map(parse_field_multiplier).collect())
                .unwrap_or_default(),
            condition_multipliers: parse_multiplier_map(obj.get("condition_multipliers")),
            age_curve: obj.get("age_curve").and_then(parse_age_curve),
            brand_multipliers: parse_multiplier_map(obj.get("brand_multipliers")),
            clamp: obj.get("clamp").and_then(Value::as_bool).unwrap_or(false),
            min_usd: obj.get("min_usd").and_then(ConditionEvaluator::as_f64),
            max_usd: obj.get("max_usd").and_then(ConditionEvaluator::as_f64),
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn with_field_multiplier<I, V>(mut self, field: impl Into<String>, cases: I) -> Self
    where
        I: IntoIterator<Item = (V, f64)>,
        V: Into<Value>,
    {
        self.field_multipliers.push(FieldMultiplier {
            field: field.into(),
            conditions: cases
                .into_iter()
                .map(|(value, multiplier)| MultiplierCase {
                    value: value.into(),
                    multiplier,
                })
                .collect(),
        });
        self
    }

    pub fn with_condition_multiplier(mut self, condition: impl Into<String>, multiplier: f64) -> Self {
        self.condition_multipliers.insert(condition.into(), multiplier);
        self
    }

    pub fn with_brand_multiplier(mut self, brand: impl Into<String>, multiplier: f64) -> Self {
        self.brand_multipliers.insert(brand.into(), multiplier);
        self
    }

    pub fn with_age_curve(mut self, rate_per_year: f64, max_depreciation: f64) -> Self {
        self.age_curve = Some(AgeCurve {
            rate_per_year,
            max_depreciation,
            field: default_age_field(),
        });
        self
    }

    pub fn with_clamp(mut self, min_usd: Option<f64>, max_usd: Option<f64>) -> Self {
        self.clamp = true;
        self.min_usd = min_usd;
        self.max_usd = max_usd;
        self
    }

    fn referenced_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self
            .field_multipliers
            .iter()
            .map(|m| m.field.clone())
            .collect();
        if !self.condition_multipliers.is_empty() {
            fields.push(CONDITION_FIELD.to_string());
        }
        if let Some(curve) = &self.age_curve {
            fields.push(curve.field.clone());
        }
        if !self.brand_multipliers.is_empty() {
            fields.push(BRAND_FIELD.to_string());
        }
        fields
    }

    /// 字段系数之积，未命中或字段缺失为 1.0
    pub fn field_factor<S>(&self, context: &S) -> f64
    where
        S: FieldSource + ?Sized,
    {
        self.field_multipliers
            .iter()
            .map(|entry| {
                let Some(actual) = resolve(context, &entry.field).and_then(match_key) else {
                    return 1.0;
                };
                entry
                    .conditions
                    .iter()
                    .find(|case| match_key(&case.value).as_deref() == Some(actual.as_str()))
                    .map(|case| case.multiplier)
                    .unwrap_or(1.0)
            })
            .product()
    }

    pub fn condition_factor<S>(&self, context: &S) -> f64
    where
        S: FieldSource + ?Sized,
    {
        lookup_multiplier(&self.condition_multipliers, resolve(context, CONDITION_FIELD))
    }

    pub fn age_factor<S>(&self, context: &S) -> f64
    where
        S: FieldSource + ?Sized,
    {
        let Some(curve) = &self.age_curve else {
            return 1.0;
        };
        resolve(context, &curve.field)
            .and_then(ConditionEvaluator::as_f64)
            .map(|age| curve.factor(age))
            .unwrap_or(1.0)
    }

    pub fn brand_factor<S>(&self, context: &S) -> f64
    where
        S: FieldSource + ?Sized,
    {
        lookup_multiplier(&self.brand_multipliers, resolve(context, BRAND_FIELD))
    }

    /// 按配置裁剪，未开启时原样返回
    pub fn apply_clamp(&self, value: f64) -> f64 {
        if !self.clamp {
            return value;
        }
        let mut out = value;
        if let Some(min) = self.min_usd {
            out = out.max(min);
        }
        if let Some(max) = self.max_usd {
            out = out.min(max);
        }
        out
    }
}

fn parse_field_multiplier(entry: &Value) -> Option<FieldMultiplier> {
    let obj = entry.as_object()?;
    let field = obj.get("field")?.as_str()?.trim();
    if field.is_empty() {
        return None;
    }

    let conditions = obj
        .get("conditions")?
        .as_array()?
        .iter()
        .filter_map(|case| {
            let case = case.as_object()?;
            let value = case.get("value").filter(|v| !v.is_null())?.clone();
            let multiplier = case.get("multiplier").and_then(ConditionEvaluator::as_f64)?;
            Some(MultiplierCase { value, multiplier })
        })
        .collect();

    Some(FieldMultiplier {
        field: field.to_string(),
        conditions,
    })
}

fn parse_multiplier_map(value: Option<&Value>) -> BTreeMap<String, f64> {
    value
        .and_then(Value::as_object)
        .map(|map: &Map<String, Value>| {
            map.iter()
                .filter_map(|(k, v)| ConditionEvaluator::as_f64(v).map(|m| (k.clone(), m)))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_age_curve(value: &Value) -> Option<AgeCurve> {
    let obj = value.as_object()?;
    let rate_per_year = obj.get("rate_per_year").and_then(ConditionEvaluator::as_f64)?;
    let max_depreciation = obj
        .get("max_depreciation")
        .and_then(ConditionEvaluator::as_f64)
        .unwrap_or(1.0);
    let field = obj
        .get("field")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(default_age_field);
    Some(AgeCurve {
        rate_per_year,
        max_depreciation,
        field,
    })
}

/// 比较用的规范化键：字符串忽略大小写与首尾空白，数值统一格式
fn match_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_lowercase()),
        Value::Number(n) => n.as_f64().map(|f| format!("{}", f)),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn lookup_multiplier(map: &BTreeMap<String, f64>, actual: Option<&Value>) -> f64 {
    let Some(key) = actual.and_then(match_key) else {
        return 1.0;
    };
    map.iter()
        .find(|(k, _)| k.trim().to_lowercase() == key)
        .map(|(_, m)| *m)
        .unwrap_or(1.0)
}

/// 动作计算明细，用于审计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionBreakdown {
    pub action_type: String,
    pub base: f64,
    pub field_multiplier: f64,
    pub condition_multiplier: f64,
    pub age_factor: f64,
    pub brand_multiplier: f64,
    pub clamped: bool,
    pub value: f64,
}

/// 动作计算器
#[derive(Debug, Clone, Default)]
pub struct ActionCalculator {
    formulas: Arc<FormulaEngine>,
}

impl ActionCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 与其他组件共享同一个公式缓存
    pub fn with_engine(formulas: Arc<FormulaEngine>) -> Self {
        Self { formulas }
    }

    pub fn formulas(&self) -> &Arc<FormulaEngine> {
        &self.formulas
    }

    /// 计算动作金额
    ///
    /// 只有公式动作可能失败，错误原样返回由调用方决定降级还是中止。
    pub fn calculate<S>(&self, action: &Action, context: &S) -> Result<f64>
    where
        S: FieldSource + ?Sized,
    {
        self.calculate_detailed(action, context).map(|b| b.value)
    }

    pub fn calculate_detailed<S>(&self, action: &Action, context: &S) -> Result<ActionBreakdown>
    where
        S: FieldSource + ?Sized,
    {
        let base = self.base_value(&action.kind, context)?;
        let modifiers = &action.modifiers;

        let field_multiplier = modifiers.field_factor(context);
        let condition_multiplier = modifiers.condition_factor(context);
        let age_factor = modifiers.age_factor(context);
        let brand_multiplier = modifiers.brand_factor(context);

        let raw = base * field_multiplier * condition_multiplier * age_factor * brand_multiplier;
        let value = modifiers.apply_clamp(raw);

        Ok(ActionBreakdown {
            action_type: action.kind.name().to_string(),
            base,
            field_multiplier,
            condition_multiplier,
            age_factor,
            brand_multiplier,
            clamped: value != raw,
            value,
        })
    }

    fn base_value<S>(&self, kind: &ActionKind, context: &S) -> Result<f64>
    where
        S: FieldSource + ?Sized,
    {
        match kind {
            ActionKind::FixedValue { value_usd } => Ok(*value_usd),
            ActionKind::PerUnit { value_usd, metric } => Ok(value_usd * metric_value(context, metric)),
            ActionKind::Formula { formula } => self.formulas.evaluate(formula, context),
            ActionKind::BenchmarkBased { value_usd, metric } => {
                Ok(value_usd * metric_value(context, metric) / BENCHMARK_DIVISOR)
            }
        }
    }

    /// 编写期校验
    pub fn validate(&self, action: &Action) -> Result<()> {
        match &action.kind {
            ActionKind::FixedValue { value_usd } => check_finite(*value_usd)?,
            ActionKind::PerUnit { value_usd, metric }
            | ActionKind::BenchmarkBased { value_usd, metric } => {
                check_finite(*value_usd)?;
                if metric.trim().is_empty() {
                    return Err(RuleError::InvalidAction(format!(
                        "{} 动作必须指定 metric",
                        action.kind.name()
                    )));
                }
            }
            ActionKind::Formula { formula } => {
                self.formulas.compile(formula)?;
            }
        }

        let modifiers = &action.modifiers;
        if modifiers.clamp {
            match (modifiers.min_usd, modifiers.max_usd) {
                (None, None) => {
                    return Err(RuleError::InvalidAction(
                        "开启 clamp 时至少需要设置 min_usd 或 max_usd".to_string(),
                    ));
                }
                (Some(min), Some(max)) if min > max => {
                    return Err(RuleError::InvalidAction(format!(
                        "min_usd ({}) 大于 max_usd ({})",
                        min, max
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

/// 缺失、为零或非数值的数量都按 0 处理
fn metric_value<S>(context: &S, metric: &str) -> f64
where
    S: FieldSource + ?Sized,
{
    resolve(context, metric)
        .and_then(ConditionEvaluator::as_f64)
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

fn check_finite(value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(RuleError::InvalidAction(format!("value_usd 不是有限数值: {}", value)))
    }
}

//! 叶子条件比较
//!
//! 把商品字段值与条件期望值按操作符比较，数值统一按浮点处理。
//! 类型错误在这里以 `Err` 返回，由条件树执行器统一降级为“不匹配”。

use crate::conditions::{ConditionLeaf, FieldType};
use crate::error::{Result, RuleError};
use crate::operators::Operator;
use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

/// 已编译正则缓存，避免同一模式在每个商品上重复编译
static REGEX_CACHE: LazyLock<DashMap<String, Regex>> = LazyLock::new(DashMap::new);

/// 比较选项
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchOptions {
    /// 字符串比较忽略大小写
    pub case_insensitive: bool,
    /// 字段声明为数值类型，字符串值按数值解析
    pub numeric: bool,
}

impl MatchOptions {
    pub fn for_leaf(leaf: &ConditionLeaf) -> Self {
        Self {
            case_insensitive: leaf.case_insensitive,
            numeric: leaf.field_type == FieldType::Number,
        }
    }
}

/// 条件评估器
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// 评估叶子条件
    pub fn evaluate_leaf(field_value: Option<&Value>, leaf: &ConditionLeaf) -> Result<bool> {
        Self::evaluate_with(
            field_value,
            leaf.operator,
            &leaf.value,
            MatchOptions::for_leaf(leaf),
        )
    }

    /// 使用默认选项评估条件，`field_value` 为 `None` 表示商品缺少该字段
    pub fn evaluate(
        field_value: Option<&Value>,
        operator: Operator,
        expected_value: &Value,
    ) -> Result<bool> {
        Self::evaluate_with(field_value, operator, expected_value, MatchOptions::default())
    }

    pub fn evaluate_with(
        field_value: Option<&Value>,
        operator: Operator,
        expected_value: &Value,
        options: MatchOptions,
    ) -> Result<bool> {
        // 字段缺失或为 null 时一律不匹配，包括 not_equals / not_in
        let field_value = match field_value {
            Some(Value::Null) | None => return Ok(false),
            Some(v) => v,
        };

        match operator {
            Operator::Equals => Self::eq(field_value, expected_value, options),
            Operator::NotEquals => Self::eq(field_value, expected_value, options).map(|r| !r),
            Operator::GreaterThan => Self::compare(field_value, expected_value, |a, b| a > b),
            Operator::Gte => Self::compare(field_value, expected_value, |a, b| a >= b),
            Operator::LessThan => Self::compare(field_value, expected_value, |a, b| a < b),
            Operator::Lte => Self::compare(field_value, expected_value, |a, b| a <= b),
            Operator::Between => Self::between(field_value, expected_value),
            Operator::In => Self::in_list(field_value, expected_value, options),
            Operator::NotIn => Self::in_list(field_value, expected_value, options).map(|r| !r),
            Operator::Contains => Self::contains(field_value, expected_value, options),
            Operator::StartsWith => Self::starts_with(field_value, expected_value, options),
            Operator::EndsWith => Self::ends_with(field_value, expected_value, options),
            Operator::Regex => Self::regex_match(field_value, expected_value, options),
        }
    }

    /// 相等比较
    fn eq(field: &Value, expected: &Value, options: MatchOptions) -> Result<bool> {
        // 数值比较需要统一转为浮点数，避免整数和浮点数比较失败（如 100 == 100.0）
        if let (Some(f1), Some(f2)) = (Self::as_f64(field), Self::as_f64(expected)) {
            return Ok((f1 - f2).abs() < f64::EPSILON);
        }

        if options.numeric && (field.is_string() || expected.is_string()) {
            // 声明为数值的字段无法解析成数字，视为类型错误
            if Self::as_f64(field).is_none() {
                return Err(Self::mismatch("number", field));
            }
        }

        if let (Value::String(a), Value::String(b)) = (field, expected) {
            return Ok(Self::str_eq(a, b, options));
        }

        // 布尔值与 "true"/"false" 字符串互相比较
        if let (Value::Bool(b), Value::String(s)) | (Value::String(s), Value::Bool(b)) =
            (field, expected)
        {
            return Ok(s.eq_ignore_ascii_case(if *b { "true" } else { "false" }));
        }

        // 其他类型直接比较
        Ok(field == expected)
    }

    fn str_eq(a: &str, b: &str, options: MatchOptions) -> bool {
        if options.case_insensitive {
            a.to_lowercase() == b.to_lowercase()
        } else {
            a == b
        }
    }

    /// 数值比较
    fn compare<F>(field: &Value, expected: &Value, cmp: F) -> Result<bool>
    where
        F: Fn(f64, f64) -> bool,
    {
        let field_num = Self::as_f64(field).ok_or_else(|| Self::mismatch("number", field))?;
        let expected_num =
            Self::as_f64(expected).ok_or_else(|| Self::mismatch("number", expected))?;

        Ok(cmp(field_num, expected_num))
    }

    /// 范围比较 (between)，两端都包含
    /// expected 为 [min, max] 数组或 {"min": .., "max": ..} 对象
    fn between(field: &Value, expected: &Value) -> Result<bool> {
        let (min, max) = Self::bounds(expected)?;
        let field_num = Self::as_f64(field).ok_or_else(|| Self::mismatch("number", field))?;

        Ok(field_num >= min && field_num <= max)
    }

    /// 解析 between 的上下界
    pub(crate) fn bounds(expected: &Value) -> Result<(f64, f64)> {
        let (lo, hi) = match expected {
            Value::Array(arr) if arr.len() == 2 => (&arr[0], &arr[1]),
            Value::Object(obj) => match (obj.get("min"), obj.get("max")) {
                (Some(lo), Some(hi)) => (lo, hi),
                _ => {
                    return Err(RuleError::InvalidCondition(
                        "between 操作符需要 {min, max} 对象".to_string(),
                    ));
                }
            },
            _ => {
                return Err(RuleError::InvalidCondition(
                    "between 操作符需要 [min, max] 数组".to_string(),
                ));
            }
        };

        let min = Self::as_f64(lo).ok_or_else(|| Self::mismatch("number", lo))?;
        let max = Self::as_f64(hi).ok_or_else(|| Self::mismatch("number", hi))?;
        Ok((min, max))
    }

    /// 列表包含检查 (in)
    fn in_list(field: &Value, expected: &Value, options: MatchOptions) -> Result<bool> {
        let arr = expected
            .as_array()
            .ok_or_else(|| Self::mismatch("array", expected))?;

        for item in arr {
            if Self::eq(field, item, options)? {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// 字符串/数组包含检查
    fn contains(field: &Value, expected: &Value, options: MatchOptions) -> Result<bool> {
        match field {
            Value::String(s) => {
                let substr = Self::expect_str(expected)?;
                if options.case_insensitive {
                    Ok(s.to_lowercase().contains(&substr.to_lowercase()))
                } else {
                    Ok(s.contains(substr))
                }
            }
            Value::Array(arr) => {
                for item in arr {
                    if Self::eq(item, expected, options)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            _ => Err(Self::mismatch("string or array", field)),
        }
    }

    /// 字符串前缀检查
    fn starts_with(field: &Value, expected: &Value, options: MatchOptions) -> Result<bool> {
        let s = Self::expect_str(field)?;
        let prefix = Self::expect_str(expected)?;

        if options.case_insensitive {
            Ok(s.to_lowercase().starts_with(&prefix.to_lowercase()))
        } else {
            Ok(s.starts_with(prefix))
        }
    }

    /// 字符串后缀检查
    fn ends_with(field: &Value, expected: &Value, options: MatchOptions) -> Result<bool> {
        let s = Self::expect_str(field)?;
        let suffix = Self::expect_str(expected)?;

        if options.case_insensitive {
            Ok(s.to_lowercase().ends_with(&suffix.to_lowercase()))
        } else {
            Ok(s.ends_with(suffix))
        }
    }

    /// 正则表达式匹配
    fn regex_match(field: &Value, expected: &Value, options: MatchOptions) -> Result<bool> {
        let s = Self::expect_str(field)?;
        let pattern = expected
            .as_str()
            .ok_or_else(|| Self::mismatch("string (regex pattern)", expected))?;

        let pattern = if options.case_insensitive {
            format!("(?i){}", pattern)
        } else {
            pattern.to_string()
        };

        Ok(Self::compiled_regex(&pattern)?.is_match(s))
    }

    /// 获取缓存的正则，首次使用时编译
    pub(crate) fn compiled_regex(pattern: &str) -> Result<Regex> {
        if let Some(regex) = REGEX_CACHE.get(pattern) {
            return Ok(regex.clone());
        }

        let regex = Regex::new(pattern).map_err(|e| {
            RuleError::InvalidCondition(format!("无效的正则表达式 '{}': {}", pattern, e))
        })?;
        REGEX_CACHE.insert(pattern.to_string(), regex.clone());
        Ok(regex)
    }

    fn expect_str(value: &Value) -> Result<&str> {
        value.as_str().ok_or_else(|| Self::mismatch("string", value))
    }

    /// 尝试将 Value 转换为 f64（数值字符串同样可以转换）
    pub fn as_f64(value: &Value) -> Option<f64> {
        match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn mismatch(expected: &str, actual: &Value) -> RuleError {
        RuleError::evaluation(
            crate::error::EvaluationErrorKind::TypeMismatch,
            format!("期望 {}, 实际 {}", expected, Self::type_name(actual)),
        )
    }

    /// 获取值的类型名称
    pub fn type_name(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ci() -> MatchOptions {
        MatchOptions {
            case_insensitive: true,
            numeric: false,
        }
    }

    #[test]
    fn test_eq_numbers() {
        assert!(ConditionEvaluator::evaluate(Some(&json!(100)), Operator::Equals, &json!(100)).unwrap());
        assert!(
            ConditionEvaluator::evaluate(Some(&json!(100.0)), Operator::Equals, &json!(100)).unwrap()
        );
        // 数值字符串自动转换
        assert!(
            ConditionEvaluator::evaluate(Some(&json!("16")), Operator::Equals, &json!(16)).unwrap()
        );
    }

    #[test]
    fn test_eq_strings_case_sensitivity() {
        assert!(!ConditionEvaluator::evaluate(
            Some(&json!("DDR4")),
            Operator::Equals,
            &json!("ddr4")
        )
        .unwrap());

        assert!(ConditionEvaluator::evaluate_with(
            Some(&json!("DDR4")),
            Operator::Equals,
            &json!("ddr4"),
            ci()
        )
        .unwrap());
    }

    #[test]
    fn test_eq_bool_and_string() {
        assert!(
            ConditionEvaluator::evaluate(Some(&json!(true)), Operator::Equals, &json!("true"))
                .unwrap()
        );
    }

    #[test]
    fn test_numeric_comparisons() {
        assert!(
            ConditionEvaluator::evaluate(Some(&json!(100)), Operator::GreaterThan, &json!(50))
                .unwrap()
        );
        assert!(ConditionEvaluator::evaluate(Some(&json!(100)), Operator::Gte, &json!(100)).unwrap());
        assert!(
            ConditionEvaluator::evaluate(Some(&json!(50)), Operator::LessThan, &json!(100)).unwrap()
        );
        assert!(ConditionEvaluator::evaluate(Some(&json!(100)), Operator::Lte, &json!(100)).unwrap());
        assert!(
            ConditionEvaluator::evaluate(Some(&json!("32")), Operator::Gte, &json!(16)).unwrap()
        );
    }

    #[test]
    fn test_compare_non_numeric_is_type_error() {
        let err = ConditionEvaluator::evaluate(Some(&json!("abc")), Operator::GreaterThan, &json!(1))
            .unwrap_err();
        assert!(err.is_runtime());
    }

    #[test]
    fn test_between_inclusive() {
        let range = json!([8, 16]);
        assert!(ConditionEvaluator::evaluate(Some(&json!(8)), Operator::Between, &range).unwrap());
        assert!(ConditionEvaluator::evaluate(Some(&json!(16)), Operator::Between, &range).unwrap());
        assert!(!ConditionEvaluator::evaluate(Some(&json!(17)), Operator::Between, &range).unwrap());
        assert!(ConditionEvaluator::evaluate(
            Some(&json!(12)),
            Operator::Between,
            &json!({"min": 8, "max": 16})
        )
        .unwrap());
    }

    #[test]
    fn test_in_and_not_in() {
        let list = json!(["new", "refurb"]);
        assert!(ConditionEvaluator::evaluate(Some(&json!("new")), Operator::In, &list).unwrap());
        assert!(!ConditionEvaluator::evaluate(Some(&json!("used")), Operator::In, &list).unwrap());
        assert!(ConditionEvaluator::evaluate(Some(&json!("used")), Operator::NotIn, &list).unwrap());
        assert!(ConditionEvaluator::evaluate_with(
            Some(&json!("NEW")),
            Operator::In,
            &list,
            ci()
        )
        .unwrap());
    }

    #[test]
    fn test_contains_string_and_array() {
        assert!(ConditionEvaluator::evaluate(
            Some(&json!("NVMe SSD")),
            Operator::Contains,
            &json!("NVMe")
        )
        .unwrap());
        assert!(ConditionEvaluator::evaluate_with(
            Some(&json!("NVMe SSD")),
            Operator::Contains,
            &json!("nvme"),
            ci()
        )
        .unwrap());
        assert!(ConditionEvaluator::evaluate(
            Some(&json!(["wifi", "bluetooth"])),
            Operator::Contains,
            &json!("wifi")
        )
        .unwrap());
    }

    #[test]
    fn test_prefix_suffix() {
        assert!(ConditionEvaluator::evaluate(
            Some(&json!("Intel Core i7")),
            Operator::StartsWith,
            &json!("Intel")
        )
        .unwrap());
        assert!(ConditionEvaluator::evaluate_with(
            Some(&json!("Intel Core i7")),
            Operator::EndsWith,
            &json!("I7"),
            ci()
        )
        .unwrap());
    }

    #[test]
    fn test_regex() {
        assert!(ConditionEvaluator::evaluate(
            Some(&json!("i7-8700K")),
            Operator::Regex,
            &json!(r"^i[579]-\d{4}")
        )
        .unwrap());
        assert!(ConditionEvaluator::evaluate(
            Some(&json!("x")),
            Operator::Regex,
            &json!("[invalid")
        )
        .is_err());
    }

    #[test]
    fn test_missing_and_null_field() {
        assert!(!ConditionEvaluator::evaluate(None, Operator::Equals, &json!("test")).unwrap());
        assert!(!ConditionEvaluator::evaluate(None, Operator::NotEquals, &json!("test")).unwrap());
        assert!(!ConditionEvaluator::evaluate(None, Operator::NotIn, &json!(["a"])).unwrap());
        assert!(
            !ConditionEvaluator::evaluate(Some(&Value::Null), Operator::Lte, &json!(1)).unwrap()
        );
    }

    #[test]
    fn test_numeric_field_type_rejects_text() {
        let opts = MatchOptions {
            case_insensitive: false,
            numeric: true,
        };
        assert!(ConditionEvaluator::evaluate_with(
            Some(&json!("sixteen")),
            Operator::Equals,
            &json!("16"),
            opts
        )
        .is_err());
    }
}

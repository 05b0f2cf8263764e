//! 估值规则引擎错误类型

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// 运行期求值错误的细分类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationErrorKind {
    /// 公式引用了上下文中不存在的变量
    UndefinedVariable,
    /// 除数为零
    ZeroDivision,
    /// 操作数类型不匹配（如字符串参与算术运算）
    TypeMismatch,
    /// 函数参数超出定义域（如对负数开平方）
    Domain,
    /// 结果为 NaN 或无穷大
    NonFinite,
}

impl EvaluationErrorKind {
    /// 每类错误的默认修复建议
    pub fn default_hint(&self) -> &'static str {
        match self {
            Self::UndefinedVariable => "检查字段名拼写，或确认调用方在上下文中提供了该字段",
            Self::ZeroDivision => "使用条件表达式保护除法，例如 `a / b if b != 0 else 0`",
            Self::TypeMismatch => "确认参与运算的字段为数值类型，字符串只能做相等比较",
            Self::Domain => "为函数参数增加范围保护，例如 `sqrt(max(x, 0))`",
            Self::NonFinite => "检查幂运算或除法是否产生了过大的中间结果",
        }
    }
}

impl fmt::Display for EvaluationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UndefinedVariable => "undefined_variable",
            Self::ZeroDivision => "zero_division",
            Self::TypeMismatch => "type_mismatch",
            Self::Domain => "domain",
            Self::NonFinite => "non_finite",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("语法错误{}: {message}", position_suffix(.position))]
    Syntax {
        message: String,
        position: Option<usize>,
        suggestion: Option<String>,
    },

    #[error("校验失败: {message}")]
    Validation {
        message: String,
        suggestion: Option<String>,
    },

    #[error("求值失败 ({kind}): {message}")]
    Evaluation {
        kind: EvaluationErrorKind,
        message: String,
        hint: String,
    },

    #[error("包不兼容: {0}")]
    Compatibility(String),

    #[error("合并策略无效: {0}")]
    MergeConflict(String),

    #[error("无效的动作: {0}")]
    InvalidAction(String),

    #[error("无效的条件: {0}")]
    InvalidCondition(String),

    #[error("无效的规则包: {0}")]
    InvalidPackage(String),

    #[error("规则集未找到: {0}")]
    RulesetNotFound(i64),

    #[error("商品未找到: {0}")]
    ItemNotFound(i64),

    #[error("仓储错误: {0}")]
    Repository(String),

    #[error("JSON 序列化错误: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

fn position_suffix(position: &Option<usize>) -> String {
    match position {
        Some(pos) => format!(" (位置 {})", pos),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, RuleError>;

impl RuleError {
    pub fn syntax(message: impl Into<String>, position: Option<usize>) -> Self {
        Self::Syntax {
            message: message.into(),
            position,
            suggestion: None,
        }
    }

    pub fn syntax_with_suggestion(
        message: impl Into<String>,
        position: Option<usize>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Syntax {
            message: message.into(),
            position,
            suggestion: Some(suggestion.into()),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn validation_with_suggestion(
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Validation {
            message: message.into(),
            suggestion: Some(suggestion.into()),
        }
    }

    /// 构造运行期错误，修复建议取该类别的默认值
    pub fn evaluation(kind: EvaluationErrorKind, message: impl Into<String>) -> Self {
        Self::Evaluation {
            kind,
            message: message.into(),
            hint: kind.default_hint().to_string(),
        }
    }

    pub fn evaluation_with_hint(
        kind: EvaluationErrorKind,
        message: impl Into<String>,
        hint: impl Into<String>,
    ) -> Self {
        Self::Evaluation {
            kind,
            message: message.into(),
            hint: hint.into(),
        }
    }

    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Syntax { .. } => "SYNTAX_ERROR",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Evaluation { .. } => "EVALUATION_ERROR",
            Self::Compatibility(_) => "COMPATIBILITY_ERROR",
            Self::MergeConflict(_) => "MERGE_CONFLICT",
            Self::InvalidAction(_) => "INVALID_ACTION",
            Self::InvalidCondition(_) => "INVALID_CONDITION",
            Self::InvalidPackage(_) => "INVALID_PACKAGE",
            Self::RulesetNotFound(_) => "RULESET_NOT_FOUND",
            Self::ItemNotFound(_) => "ITEM_NOT_FOUND",
            Self::Repository(_) => "REPOSITORY_ERROR",
            Self::JsonError(_) => "JSON_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// 是否为依赖具体数据的运行期错误
    ///
    /// 这类错误只影响当前商品，不代表规则本身写错。
    pub fn is_runtime(&self) -> bool {
        matches!(self, Self::Evaluation { .. })
    }

    /// 是否为编写期错误（语法或语义校验失败）
    pub fn is_authoring(&self) -> bool {
        matches!(
            self,
            Self::Syntax { .. }
                | Self::Validation { .. }
                | Self::InvalidAction(_)
                | Self::InvalidCondition(_)
        )
    }

    /// 附带的修复建议
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Syntax { suggestion, .. } | Self::Validation { suggestion, .. } => {
                suggestion.as_deref()
            }
            Self::Evaluation { hint, .. } => Some(hint.as_str()),
            _ => None,
        }
    }
}

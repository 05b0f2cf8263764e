//! 公式语义校验
//!
//! 在构树之后、求值之前对表达式做静态检查。错误阻止公式使用，
//! 警告只提示合法但有风险的写法。

use super::ast::{BinaryOp, Expr, LogicalOp};
use crate::error::RuleError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use strsim::levenshtein;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// 校验诊断
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl Diagnostic {
    pub fn new(severity: Severity, code: &str, message: impl Into<String>) -> Self {
        Self {
            severity,
            code: code.to_string(),
            message: message.into(),
            position: None,
            suggestion: None,
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, code, message)
    }

    pub fn warning(code: &str, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, code, message)
    }

    pub fn info(code: &str, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, code, message)
    }

    pub fn at(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }

    pub fn suggest(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// 把解析或求值错误转换为错误级诊断
    pub fn from_error(error: &RuleError) -> Self {
        let message = match error {
            RuleError::Syntax { message, .. } | RuleError::Validation { message, .. } => {
                message.clone()
            }
            RuleError::Evaluation { message, .. } => message.clone(),
            other => other.to_string(),
        };

        let mut diagnostic = Self::error(error.code(), message);
        if let RuleError::Syntax {
            position: Some(pos),
            ..
        } = error
        {
            diagnostic.position = Some(*pos);
        }
        diagnostic.suggestion = error.suggestion().map(str::to_string);
        diagnostic
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    /// 转回错误，供编译阶段直接失败使用
    pub fn into_error(self) -> RuleError {
        match self.suggestion {
            Some(suggestion) => RuleError::validation_with_suggestion(self.message, suggestion),
            None => RuleError::validation(self.message),
        }
    }
}

/// 公式结构限制
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormulaLimits {
    /// 超过即报错
    pub max_depth: usize,
    /// 超过即警告
    pub warn_depth: usize,
}

impl Default for FormulaLimits {
    fn default() -> Self {
        Self {
            max_depth: 32,
            warn_depth: 8,
        }
    }
}

/// 表达式语义校验器
#[derive(Debug, Clone, Default)]
pub struct ExpressionValidator {
    limits: FormulaLimits,
}

impl ExpressionValidator {
    pub fn new(limits: FormulaLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> FormulaLimits {
        self.limits
    }

    /// 校验表达式
    ///
    /// `available_fields` 为空时跳过字段可用性检查。
    pub fn validate(
        &self,
        expr: &Expr,
        available_fields: Option<&BTreeSet<String>>,
    ) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();

        let depth = expr.depth();
        if depth > self.limits.max_depth {
            diagnostics.push(
                Diagnostic::error(
                    "NESTING_TOO_DEEP",
                    format!("表达式嵌套 {} 层，超过上限 {}", depth, self.limits.max_depth),
                )
                .suggest("拆分为多条规则或提取中间字段"),
            );
        } else if depth > self.limits.warn_depth {
            diagnostics.push(Diagnostic::warning(
                "DEEP_NESTING",
                format!("表达式嵌套 {} 层，可读性较差", depth),
            ));
        }

        let mut walker = Walker::default();
        walker.walk(expr, &mut Vec::new());
        diagnostics.extend(walker.diagnostics);

        if walker.divisions > 1 {
            diagnostics.push(
                Diagnostic::warning(
                    "MULTIPLE_DIVISIONS",
                    format!("公式包含 {} 处除法", walker.divisions),
                )
                .suggest("确认每个除数都不会为零"),
            );
        }

        if let Some(available) = available_fields {
            for field in expr.referenced_fields() {
                if !is_available(&field, available) {
                    let mut diagnostic =
                        Diagnostic::error("UNKNOWN_FIELD", format!("未知字段 '{}'", field));
                    if let Some(candidate) =
                        closest_match(&field, available.iter().map(String::as_str))
                    {
                        diagnostic = diagnostic.suggest(format!("是否想引用 '{}'？", candidate));
                    }
                    diagnostics.push(diagnostic);
                }
            }
        }

        if expr.is_constant() {
            diagnostics.push(Diagnostic::info(
                "CONSTANT_FORMULA",
                "公式不引用任何字段，可以改用固定金额动作",
            ));
        }

        diagnostics
    }
}

/// 字段本身、其子路径或其上级路径在可用集合中即视为可用
fn is_available(field: &str, available: &BTreeSet<String>) -> bool {
    if available.contains(field) {
        return true;
    }

    let prefix = format!("{}.", field);
    if available.iter().any(|f| f.starts_with(&prefix)) {
        return true;
    }

    field
        .match_indices('.')
        .any(|(idx, _)| available.contains(&field[..idx]))
}

/// 递归检查函数参数个数和除法保护
#[derive(Default)]
struct Walker {
    diagnostics: Vec<Diagnostic>,
    divisions: usize,
}

impl Walker {
    /// `guards` 为外层条件中出现过的字段集合
    fn walk(&mut self, expr: &Expr, guards: &mut Vec<BTreeSet<String>>) {
        match expr {
            Expr::Call {
                function,
                args,
                pos,
            } => {
                let (min, max) = function.arity();
                let count = args.len();
                if count < min || max.is_some_and(|m| count > m) {
                    let expected = match max {
                        Some(m) if m == min => format!("{}", min),
                        Some(m) => format!("{} 到 {}", min, m),
                        None => format!("至少 {}", min),
                    };
                    self.diagnostics.push(
                        Diagnostic::error(
                            "INVALID_ARITY",
                            format!("{}() 需要 {} 个参数，实际 {} 个", function, expected, count),
                        )
                        .at(*pos),
                    );
                }
                for arg in args {
                    self.walk(arg, guards);
                }
            }
            Expr::Binary { op, lhs, rhs, pos } => {
                if op.is_division() {
                    self.divisions += 1;
                    self.check_divisor(*op, rhs, *pos, guards);
                }
                self.walk(lhs, guards);
                self.walk(rhs, guards);
            }
            Expr::Conditional {
                condition,
                then_branch,
                else_branch,
            } => {
                self.walk(condition, guards);
                guards.push(condition.referenced_fields());
                self.walk(then_branch, guards);
                self.walk(else_branch, guards);
                guards.pop();
            }
            Expr::Logical {
                op: LogicalOp::And,
                lhs,
                rhs,
            } => {
                self.walk(lhs, guards);
                guards.push(lhs.referenced_fields());
                self.walk(rhs, guards);
                guards.pop();
            }
            other => {
                for child in other.children() {
                    self.walk(child, guards);
                }
            }
        }
    }

    fn check_divisor(
        &mut self,
        op: BinaryOp,
        divisor: &Expr,
        pos: usize,
        guards: &[BTreeSet<String>],
    ) {
        if let Expr::Number(n) = divisor {
            if *n == 0.0 {
                self.diagnostics.push(
                    Diagnostic::error("DIVISION_BY_ZERO", format!("'{}' 的除数恒为零", op.symbol()))
                        .at(pos),
                );
            }
            return;
        }

        if divisor.is_constant() {
            return;
        }

        let fields = divisor.referenced_fields();
        let guarded = guards
            .iter()
            .any(|guard| fields.iter().any(|f| guard.contains(f)));

        if !guarded {
            self.diagnostics.push(
                Diagnostic::warning(
                    "UNGUARDED_DIVISION",
                    format!("'{}' 的除数可能为零", op.symbol()),
                )
                .at(pos)
                .suggest("使用条件保护，例如 `a / b if b != 0 else 0`"),
            );
        }
    }
}

/// 在候选中找最相近的名称，差异过大时返回 None
pub(crate) fn closest_match<'a, I>(target: &str, candidates: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let limit = (target.chars().count() / 3).max(2);
    candidates
        .into_iter()
        .filter(|c| *c != target)
        .map(|c| (levenshtein(target, c), c))
        .filter(|(d, _)| *d <= limit)
        .min_by(|(da, a), (db, b)| da.cmp(db).then_with(|| a.cmp(b)))
        .map(|(_, c)| c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::parse;

    fn codes(src: &str, available: Option<&BTreeSet<String>>) -> Vec<String> {
        ExpressionValidator::default()
            .validate(&parse(src).unwrap(), available)
            .into_iter()
            .map(|d| d.code)
            .collect()
    }

    #[test]
    fn test_closest_match() {
        assert_eq!(closest_match("ram_gbb", ["ram_gb", "storage_gb"]), Some("ram_gb"));
        assert_eq!(closest_match("ram_bg", ["ram_gb", "rom_gb"]), Some("ram_gb"));
        assert_eq!(closest_match("xyz", ["ram_gb"]), None);
        assert_eq!(closest_match("ram_gb", ["ram_gb"]), None);
    }

    #[test]
    fn test_arity_errors() {
        let diagnostics = ExpressionValidator::default().validate(&parse("clamp(1, 2)").unwrap(), None);
        assert!(diagnostics.iter().any(|d| d.code == "INVALID_ARITY" && d.is_error()));
        assert!(!codes("round(x, 2)", None).contains(&"INVALID_ARITY".to_string()));
        assert!(codes("sqrt(1, 2)", None).contains(&"INVALID_ARITY".to_string()));
        assert!(codes("max()", None).contains(&"INVALID_ARITY".to_string()));
    }

    #[test]
    fn test_division_warnings() {
        assert!(codes("a / b", None).contains(&"UNGUARDED_DIVISION".to_string()));
        assert!(!codes("a / b if b != 0 else 0", None).contains(&"UNGUARDED_DIVISION".to_string()));
        assert!(!codes("b > 0 and a / b > 1", None).contains(&"UNGUARDED_DIVISION".to_string()));
        assert!(!codes("a / 1000", None).contains(&"UNGUARDED_DIVISION".to_string()));
        assert!(codes("a / 0", None).contains(&"DIVISION_BY_ZERO".to_string()));
        assert!(codes("a / 2 / 4", None).contains(&"MULTIPLE_DIVISIONS".to_string()));
    }

    #[test]
    fn test_depth_limits() {
        let validator = ExpressionValidator::new(FormulaLimits {
            max_depth: 6,
            warn_depth: 3,
        });
        let shallow = validator.validate(&parse("a + 1").unwrap(), None);
        assert!(shallow.is_empty());

        let medium = validator.validate(&parse("((a + 1) * 2) - 3").unwrap(), None);
        assert!(medium.iter().any(|d| d.code == "DEEP_NESTING"));

        let deep = validator.validate(&parse("((((((a + 1) + 1) + 1) + 1) + 1) + 1)").unwrap(), None);
        assert!(deep.iter().any(|d| d.code == "NESTING_TOO_DEEP" && d.is_error()));
    }

    #[test]
    fn test_unknown_fields_with_suggestion() {
        let available: BTreeSet<String> = ["ram_gb", "cpu.cpu_mark_multi", "custom"]
            .into_iter()
            .map(String::from)
            .collect();

        let diagnostics = ExpressionValidator::default()
            .validate(&parse("ram_gbb * cpu.cpu_mark_multi + custom.bonus").unwrap(), Some(&available));
        let unknown: Vec<_> = diagnostics.iter().filter(|d| d.code == "UNKNOWN_FIELD").collect();

        assert_eq!(unknown.len(), 1);
        assert_eq!(unknown[0].suggestion.as_deref(), Some("是否想引用 'ram_gb'？"));
        assert!(is_available("cpu", &available));
    }

    #[test]
    fn test_constant_formula_info() {
        let diagnostics = ExpressionValidator::default().validate(&parse("10 * 2").unwrap(), None);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].severity, Severity::Info);
    }

    #[test]
    fn test_diagnostic_from_syntax_error() {
        let err = parse("(a + 1").unwrap_err();
        let diagnostic = Diagnostic::from_error(&err);
        assert_eq!(diagnostic.code, "SYNTAX_ERROR");
        assert_eq!(diagnostic.position, Some(6));
    }
}

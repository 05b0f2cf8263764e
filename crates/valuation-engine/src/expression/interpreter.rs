//! 公式求值
//!
//! 只读遍历表达式树，对上下文没有任何写操作。

use super::ast::{BinaryOp, CompareOp, Expr, FieldRef, Function, LogicalOp, UnaryOp};
use super::validator::closest_match;
use crate::context::{FieldSource, resolve};
use crate::error::{EvaluationErrorKind, Result, RuleError};
use serde_json::Value;
use std::fmt;

/// 求值中间结果
#[derive(Debug, Clone, PartialEq)]
pub enum ExprValue {
    Number(f64),
    Bool(bool),
    Str(String),
}

impl ExprValue {
    fn from_json(field: &FieldRef, value: &Value) -> Result<Self> {
        match value {
            Value::Number(n) => n.as_f64().map(ExprValue::Number).ok_or_else(|| {
                RuleError::evaluation(
                    EvaluationErrorKind::TypeMismatch,
                    format!("字段 {} 的数值无法表示为浮点数", field.dotted()),
                )
            }),
            Value::Bool(b) => Ok(ExprValue::Bool(*b)),
            Value::String(s) => Ok(ExprValue::Str(s.clone())),
            other => Err(RuleError::evaluation(
                EvaluationErrorKind::TypeMismatch,
                format!(
                    "字段 {} 是 {}，不能参与公式运算",
                    field.dotted(),
                    crate::evaluator::ConditionEvaluator::type_name(other)
                ),
            )),
        }
    }

    /// 转为数值，布尔按 1/0 处理
    pub fn as_number(&self) -> Result<f64> {
        match self {
            ExprValue::Number(n) => Ok(*n),
            ExprValue::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            ExprValue::Str(s) => Err(RuleError::evaluation(
                EvaluationErrorKind::TypeMismatch,
                format!("字符串 \"{}\" 不能参与算术运算", s),
            )),
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            ExprValue::Number(n) => *n != 0.0,
            ExprValue::Bool(b) => *b,
            ExprValue::Str(s) => !s.is_empty(),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            ExprValue::Number(_) => "number",
            ExprValue::Bool(_) => "boolean",
            ExprValue::Str(_) => "string",
        }
    }
}

impl fmt::Display for ExprValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprValue::Number(n) => write!(f, "{}", n),
            ExprValue::Bool(b) => write!(f, "{}", b),
            ExprValue::Str(s) => write!(f, "\"{}\"", s),
        }
    }
}

/// 求值表达式
pub fn evaluate<S>(expr: &Expr, source: &S) -> Result<ExprValue>
where
    S: FieldSource + ?Sized,
{
    Interpreter { source }.eval(expr)
}

/// 求值并要求结果为有限数值
pub fn evaluate_number<S>(expr: &Expr, source: &S) -> Result<f64>
where
    S: FieldSource + ?Sized,
{
    let value = evaluate(expr, source)?.as_number()?;
    finite(value, "公式结果")
}

fn finite(value: f64, what: &str) -> Result<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(RuleError::evaluation(
            EvaluationErrorKind::NonFinite,
            format!("{}不是有限数值: {}", what, value),
        ))
    }
}

fn zero_division(op: BinaryOp) -> RuleError {
    RuleError::evaluation(
        EvaluationErrorKind::ZeroDivision,
        format!("'{}' 的除数为零", op.symbol()),
    )
}

fn domain(message: impl Into<String>) -> RuleError {
    RuleError::evaluation(EvaluationErrorKind::Domain, message)
}

struct Interpreter<'a, S: ?Sized> {
    source: &'a S,
}

impl<S> Interpreter<'_, S>
where
    S: FieldSource + ?Sized,
{
    fn eval(&self, expr: &Expr) -> Result<ExprValue> {
        match expr {
            Expr::Number(n) => Ok(ExprValue::Number(*n)),
            Expr::Bool(b) => Ok(ExprValue::Bool(*b)),
            Expr::Str(s) => Ok(ExprValue::Str(s.clone())),
            Expr::Field(field) => self.lookup(field),
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(ExprValue::Bool(!value.truthy())),
                    UnaryOp::Neg => Ok(ExprValue::Number(-value.as_number()?)),
                    UnaryOp::Pos => Ok(ExprValue::Number(value.as_number()?)),
                }
            }
            Expr::Binary { op, lhs, rhs, .. } => {
                let a = self.eval(lhs)?.as_number()?;
                let b = self.eval(rhs)?.as_number()?;
                arithmetic(*op, a, b).map(ExprValue::Number)
            }
            Expr::Compare { op, lhs, rhs } => {
                let a = self.eval(lhs)?;
                let b = self.eval(rhs)?;
                compare(*op, &a, &b).map(ExprValue::Bool)
            }
            Expr::Logical { op, lhs, rhs } => {
                let a = self.eval(lhs)?;
                // 短路：决定结果的操作数原样返回，另一侧不求值
                match (op, a.truthy()) {
                    (LogicalOp::And, false) | (LogicalOp::Or, true) => Ok(a),
                    _ => self.eval(rhs),
                }
            }
            Expr::Conditional {
                condition,
                then_branch,
                else_branch,
            } => {
                if self.eval(condition)?.truthy() {
                    self.eval(then_branch)
                } else {
                    self.eval(else_branch)
                }
            }
            Expr::Call { function, args, .. } => {
                let values = args
                    .iter()
                    .map(|arg| self.eval(arg).and_then(|v| v.as_number()))
                    .collect::<Result<Vec<f64>>>()?;
                call(*function, &values).map(ExprValue::Number)
            }
        }
    }

    fn lookup(&self, field: &FieldRef) -> Result<ExprValue> {
        let dotted = field.dotted();
        match resolve(self.source, &dotted) {
            Some(value) => ExprValue::from_json(field, value),
            None => {
                let hint = match closest_match(&dotted, self.source.field_names()) {
                    Some(candidate) => format!("是否想引用 '{}'？", candidate),
                    None => EvaluationErrorKind::UndefinedVariable
                        .default_hint()
                        .to_string(),
                };
                Err(RuleError::evaluation_with_hint(
                    EvaluationErrorKind::UndefinedVariable,
                    format!("未定义的变量 '{}'", dotted),
                    hint,
                ))
            }
        }
    }
}

fn arithmetic(op: BinaryOp, a: f64, b: f64) -> Result<f64> {
    if op.is_division() && b == 0.0 {
        return Err(zero_division(op));
    }

    let value = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::FloorDiv => (a / b).floor(),
        BinaryOp::Mod => {
            // 余数符号跟随除数
            let r = a % b;
            if r != 0.0 && (r < 0.0) != (b < 0.0) {
                r + b
            } else {
                r
            }
        }
        BinaryOp::Pow => {
            if a < 0.0 && b.fract() != 0.0 {
                return Err(domain(format!("负数 {} 不能做非整数次幂 {}", a, b)));
            }
            a.powf(b)
        }
    };

    finite(value, &format!("'{}' 运算结果", op.symbol()))
}

fn compare(op: CompareOp, a: &ExprValue, b: &ExprValue) -> Result<bool> {
    match (a, b) {
        (ExprValue::Str(x), ExprValue::Str(y)) => match op {
            CompareOp::Eq => Ok(x == y),
            CompareOp::Ne => Ok(x != y),
            _ => Err(RuleError::evaluation(
                EvaluationErrorKind::TypeMismatch,
                "字符串只支持 == 和 != 比较",
            )),
        },
        (ExprValue::Str(_), _) | (_, ExprValue::Str(_)) => match op {
            // 类型不同的值永不相等
            CompareOp::Eq => Ok(false),
            CompareOp::Ne => Ok(true),
            _ => Err(RuleError::evaluation(
                EvaluationErrorKind::TypeMismatch,
                format!("不能比较 {} 与 {}", a.type_name(), b.type_name()),
            )),
        },
        _ => {
            let x = a.as_number()?;
            let y = b.as_number()?;
            Ok(match op {
                CompareOp::Eq => x == y,
                CompareOp::Ne => x != y,
                CompareOp::Lt => x < y,
                CompareOp::Le => x <= y,
                CompareOp::Gt => x > y,
                CompareOp::Ge => x >= y,
            })
        }
    }
}

fn call(function: Function, args: &[f64]) -> Result<f64> {
    let (min_args, max_args) = function.arity();
    if args.len() < min_args || max_args.is_some_and(|max| args.len() > max) {
        return Err(RuleError::validation(format!(
            "{}() 的参数个数不正确: {}",
            function,
            args.len()
        )));
    }

    let value = match function {
        Function::Min => args.iter().copied().fold(f64::INFINITY, f64::min),
        Function::Max => args.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        Function::Abs => args[0].abs(),
        Function::Floor => args[0].floor(),
        Function::Ceil => args[0].ceil(),
        Function::Sqrt => {
            if args[0] < 0.0 {
                return Err(domain(format!("不能对负数 {} 开平方", args[0])));
            }
            args[0].sqrt()
        }
        Function::Round => {
            let digits = args.get(1).copied().unwrap_or(0.0);
            if digits.fract() != 0.0 {
                return Err(domain(format!("round() 的小数位数必须为整数: {}", digits)));
            }
            // 银行家舍入，与常见财务计算口径一致
            let scale = 10f64.powi(digits as i32);
            (args[0] * scale).round_ties_even() / scale
        }
        Function::Clamp => {
            let (x, lo, hi) = (args[0], args[1], args[2]);
            if lo > hi {
                return Err(domain(format!("clamp() 下界 {} 大于上界 {}", lo, hi)));
            }
            x.clamp(lo, hi)
        }
    };

    finite(value, &format!("{}()", function))
}

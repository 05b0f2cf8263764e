//! 沙箱公式表达式
//!
//! 公式只能读取上下文字段并做算术、比较、条件与白名单函数运算，
//! 不存在任何到宿主运行时的通道。

pub mod ast;
pub mod engine;
pub mod interpreter;
pub mod lexer;
pub mod parser;
pub mod validator;

pub use ast::{Expr, FieldRef, Function};
pub use engine::{CompiledFormula, FormulaEngine, FormulaValidation};
pub use interpreter::{ExprValue, evaluate, evaluate_number};
pub use parser::parse;
pub use validator::{Diagnostic, ExpressionValidator, FormulaLimits, Severity};

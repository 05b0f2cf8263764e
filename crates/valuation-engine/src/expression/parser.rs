//! 公式语法分析
//!
//! 递归下降解析，优先级从低到高：
//! 条件表达式 < or < and < not < 比较 < 加减 < 乘除 < 一元 < 幂 < 基本项。
//!
//! 结构上不允许的写法（声明、导入、lambda、下划线开头的内部属性、白名单外的函数调用）
//! 在构树阶段直接失败，不会得到任何可执行的节点。

use super::ast::{BinaryOp, CompareOp, Expr, FieldRef, Function, LogicalOp, UnaryOp};
use super::lexer::{Lexer, Token, TokenKind};
use super::validator::closest_match;
use crate::error::{Result, RuleError};

/// 解析阶段允许的最大嵌套层数，防止病态输入耗尽调用栈
pub const MAX_PARSE_DEPTH: usize = 64;

/// 声明与语句类关键字
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "lambda", "import", "from", "def", "class", "del", "global", "nonlocal", "return", "yield",
    "while", "for", "with", "async", "await", "let", "var", "const", "fn", "function", "new",
    "try", "except", "raise", "assert", "pass", "is", "in",
];

/// 动态执行与反射类函数
const DYNAMIC_EXECUTION: &[&str] = &[
    "eval", "exec", "compile", "open", "getattr", "setattr", "delattr", "globals", "locals",
    "vars", "input", "breakpoint", "type", "object", "system", "require",
];

/// 解析公式文本
pub fn parse(text: &str) -> Result<Expr> {
    if text.trim().is_empty() {
        return Err(RuleError::syntax_with_suggestion(
            "公式为空",
            None,
            "输入一个表达式，例如 ram_gb * 2.5",
        ));
    }

    let tokens = Lexer::new(text).tokenize()?;
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_expr()?;
    parser.expect_eof()?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    fn peek(&self) -> &Token {
        // tokenize 保证最后一个 token 是 Eof
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if &self.peek().kind == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn is_keyword(&self, word: &str) -> bool {
        matches!(&self.peek().kind, TokenKind::Ident(name) if name == word)
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        if self.is_keyword(word) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, message: &str) -> Result<Token> {
        if &self.peek().kind == kind {
            Ok(self.advance())
        } else {
            let token = self.peek();
            Err(RuleError::syntax(
                format!("{}，遇到 {}", message, token.kind.describe()),
                Some(token.pos),
            ))
        }
    }

    fn expect_eof(&self) -> Result<()> {
        let token = self.peek();
        if token.kind == TokenKind::Eof {
            Ok(())
        } else {
            Err(RuleError::syntax_with_suggestion(
                format!("表达式末尾有多余内容 {}", token.kind.describe()),
                Some(token.pos),
                "检查是否缺少运算符或括号",
            ))
        }
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_PARSE_DEPTH {
            return Err(RuleError::syntax_with_suggestion(
                format!("表达式嵌套超过 {} 层", MAX_PARSE_DEPTH),
                Some(self.peek().pos),
                "拆分表达式或减少括号嵌套",
            ));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_ternary()
    }

    /// `a if cond else b` 或 `cond ? a : b`
    fn parse_ternary(&mut self) -> Result<Expr> {
        self.enter()?;
        let value = self.parse_or()?;

        let expr = if self.eat_keyword("if") {
            let condition = self.parse_or()?;
            if !self.eat_keyword("else") {
                let token = self.peek();
                return Err(RuleError::syntax_with_suggestion(
                    format!("条件表达式缺少 else 分支，遇到 {}", token.kind.describe()),
                    Some(token.pos),
                    "写法为 `值A if 条件 else 值B`",
                ));
            }
            let else_branch = self.parse_ternary()?;
            Expr::Conditional {
                condition: Box::new(condition),
                then_branch: Box::new(value),
                else_branch: Box::new(else_branch),
            }
        } else if self.eat(&TokenKind::Question) {
            let then_branch = self.parse_ternary()?;
            self.expect(&TokenKind::Colon, "条件表达式缺少 ':'")?;
            let else_branch = self.parse_ternary()?;
            Expr::Conditional {
                condition: Box::new(value),
                then_branch: Box::new(then_branch),
                else_branch: Box::new(else_branch),
            }
        } else {
            value
        };

        self.leave();
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.eat_keyword("or") || self.eat(&TokenKind::OrOr) {
            let rhs = self.parse_and()?;
            lhs = Expr::Logical {
                op: LogicalOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_not()?;
        while self.eat_keyword("and") || self.eat(&TokenKind::AndAnd) {
            let rhs = self.parse_not()?;
            lhs = Expr::Logical {
                op: LogicalOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.eat_keyword("not") || self.eat(&TokenKind::Bang) {
            self.enter()?;
            let operand = self.parse_not()?;
            self.leave();
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.parse_comparison()
    }

    fn compare_op(kind: &TokenKind) -> Option<CompareOp> {
        match kind {
            TokenKind::EqEq => Some(CompareOp::Eq),
            TokenKind::NotEq => Some(CompareOp::Ne),
            TokenKind::Lt => Some(CompareOp::Lt),
            TokenKind::Le => Some(CompareOp::Le),
            TokenKind::Gt => Some(CompareOp::Gt),
            TokenKind::Ge => Some(CompareOp::Ge),
            _ => None,
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let lhs = self.parse_additive()?;

        let Some(op) = Self::compare_op(&self.peek().kind) else {
            return Ok(lhs);
        };
        self.advance();
        let rhs = self.parse_additive()?;

        if Self::compare_op(&self.peek().kind).is_some() {
            return Err(RuleError::syntax_with_suggestion(
                "不支持链式比较",
                Some(self.peek().pos),
                "改写为 `a < b and b < c`",
            ));
        }

        Ok(Expr::Compare {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_term()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            let pos = self.advance().pos;
            let rhs = self.parse_term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                pos,
            };
        }
    }

    fn parse_term(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::DoubleSlash => BinaryOp::FloorDiv,
                TokenKind::Percent => BinaryOp::Mod,
                _ => return Ok(lhs),
            };
            let pos = self.advance().pos;
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                pos,
            };
        }
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let op = match self.peek().kind {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Plus => UnaryOp::Pos,
            _ => return self.parse_power(),
        };
        self.advance();
        self.enter()?;
        let operand = self.parse_unary()?;
        self.leave();
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    /// 幂运算右结合，且比左侧一元负号绑定更紧：-2 ** 2 == -4
    fn parse_power(&mut self) -> Result<Expr> {
        let base = self.parse_primary()?;
        if self.peek().kind == TokenKind::DoubleStar {
            let pos = self.advance().pos;
            self.enter()?;
            let exponent = self.parse_unary()?;
            self.leave();
            return Ok(Expr::Binary {
                op: BinaryOp::Pow,
                lhs: Box::new(base),
                rhs: Box::new(exponent),
                pos,
            });
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let token = self.advance();
        match token.kind {
            TokenKind::Number(n) => Ok(Expr::Number(n)),
            TokenKind::Str(s) => Ok(Expr::Str(s)),
            TokenKind::LParen => {
                let expr = self.parse_expr()?;
                self.expect(&TokenKind::RParen, "缺少右括号 ')'")?;
                Ok(expr)
            }
            TokenKind::Ident(name) => self.parse_name(name, token.pos),
            TokenKind::Eof => Err(RuleError::syntax_with_suggestion(
                "表达式不完整",
                Some(token.pos),
                "检查末尾是否缺少操作数",
            )),
            other => Err(RuleError::syntax(
                format!("意外的符号 {}", other.describe()),
                Some(token.pos),
            )),
        }
    }

    fn parse_name(&mut self, name: String, pos: usize) -> Result<Expr> {
        match name.as_str() {
            "True" | "true" => return Ok(Expr::Bool(true)),
            "False" | "false" => return Ok(Expr::Bool(false)),
            "if" | "else" | "and" | "or" | "not" => {
                return Err(RuleError::syntax(
                    format!("意外的关键字 '{}'", name),
                    Some(pos),
                ));
            }
            _ => {}
        }

        if FORBIDDEN_KEYWORDS.contains(&name.as_str()) {
            return Err(RuleError::syntax_with_suggestion(
                format!("公式中不允许使用 '{}'", name),
                Some(pos),
                "公式只能是单个算术或条件表达式，不能声明、导入或定义函数",
            ));
        }

        let mut segments = vec![name];
        while self.peek().kind == TokenKind::Dot {
            self.advance();
            let token = self.advance();
            match token.kind {
                TokenKind::Ident(segment) => segments.push(segment),
                other => {
                    return Err(RuleError::syntax(
                        format!("点号后需要字段名，遇到 {}", other.describe()),
                        Some(token.pos),
                    ));
                }
            }
        }

        if let Some(internal) = segments.iter().find(|s| s.starts_with('_')) {
            return Err(RuleError::validation_with_suggestion(
                format!("禁止访问内部属性 '{}'", internal),
                "只能引用商品字段，例如 cpu.cpu_mark_multi",
            ));
        }

        if self.peek().kind == TokenKind::LParen {
            return self.parse_call(segments, pos);
        }

        Ok(Expr::Field(FieldRef { segments, pos }))
    }

    fn parse_call(&mut self, segments: Vec<String>, pos: usize) -> Result<Expr> {
        let name = segments.join(".");

        if segments.len() > 1 {
            return Err(RuleError::validation_with_suggestion(
                format!("不支持方法调用 '{}()'", name),
                format!("可用函数: {}", Function::allow_list()),
            ));
        }

        let Some(function) = Function::from_name(&name) else {
            if DYNAMIC_EXECUTION.contains(&name.as_str()) {
                return Err(RuleError::validation_with_suggestion(
                    format!("禁止动态执行代码: '{}'", name),
                    format!("可用函数: {}", Function::allow_list()),
                ));
            }

            let allowed: Vec<&str> = Function::ALL.iter().map(Function::name).collect();
            let suggestion = match closest_match(&name, allowed.iter().copied()) {
                Some(candidate) => format!("是否想使用 {}()？", candidate),
                None => format!("可用函数: {}", Function::allow_list()),
            };
            return Err(RuleError::validation_with_suggestion(
                format!("函数 '{}' 不在允许列表中", name),
                suggestion,
            ));
        };

        self.expect(&TokenKind::LParen, "函数调用缺少 '('")?;
        let mut args = Vec::new();
        if !self.eat(&TokenKind::RParen) {
            loop {
                args.push(self.parse_expr()?);
                if self.eat(&TokenKind::Comma) {
                    continue;
                }
                self.expect(&TokenKind::RParen, "函数参数列表缺少 ')'")?;
                break;
            }
        }

        Ok(Expr::Call {
            function,
            args,
            pos,
        })
    }
}

//! 公式词法分析
//!
//! 赋值、下标、集合字面量、语句分隔符在这一层就被拒绝，不会产生任何 token。

use crate::error::{Result, RuleError};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Number(f64),
    Str(String),
    Ident(String),

    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,

    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,

    AndAnd,
    OrOr,
    Bang,
    Question,
    Colon,

    Dot,
    Comma,
    LParen,
    RParen,

    Eof,
}

impl TokenKind {
    /// 错误信息中展示的 token 文本
    pub fn describe(&self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Str(s) => format!("\"{}\"", s),
            Self::Ident(name) => name.clone(),
            Self::Plus => "+".into(),
            Self::Minus => "-".into(),
            Self::Star => "*".into(),
            Self::DoubleStar => "**".into(),
            Self::Slash => "/".into(),
            Self::DoubleSlash => "//".into(),
            Self::Percent => "%".into(),
            Self::EqEq => "==".into(),
            Self::NotEq => "!=".into(),
            Self::Lt => "<".into(),
            Self::Le => "<=".into(),
            Self::Gt => ">".into(),
            Self::Ge => ">=".into(),
            Self::AndAnd => "&&".into(),
            Self::OrOr => "||".into(),
            Self::Bang => "!".into(),
            Self::Question => "?".into(),
            Self::Colon => ":".into(),
            Self::Dot => ".".into(),
            Self::Comma => ",".into(),
            Self::LParen => "(".into(),
            Self::RParen => ")".into(),
            Self::Eof => "输入结束".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// 在原始文本中的字节偏移
    pub pos: usize,
}

/// 公式最大长度，超长文本直接拒绝
pub const MAX_FORMULA_LEN: usize = 4096;

pub struct Lexer<'src> {
    src: &'src str,
    bytes: &'src [u8],
    pos: usize,
}

impl<'src> Lexer<'src> {
    pub fn new(src: &'src str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
        }
    }

    /// 切分全部 token，末尾追加 Eof
    pub fn tokenize(mut self) -> Result<Vec<Token>> {
        if self.src.len() > MAX_FORMULA_LEN {
            return Err(RuleError::syntax_with_suggestion(
                format!("公式长度 {} 超过上限 {}", self.src.len(), MAX_FORMULA_LEN),
                None,
                "拆分为多条规则或简化表达式",
            ));
        }

        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn next_token(&mut self) -> Result<Token> {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }

        let start = self.pos;
        let Some(byte) = self.peek() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                pos: start,
            });
        };

        let kind = match byte {
            b'0'..=b'9' => self.lex_number()?,
            b'.' if matches!(self.peek_at(1), Some(b'0'..=b'9')) => self.lex_number()?,
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.lex_ident(),
            b'"' | b'\'' => self.lex_string(byte)?,
            _ => self.lex_operator(byte)?,
        };

        Ok(Token { kind, pos: start })
    }

    fn lex_number(&mut self) -> Result<TokenKind> {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        if self.peek() == Some(b'.') && matches!(self.peek_at(1), Some(b'0'..=b'9')) {
            self.pos += 1;
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            let sign = usize::from(matches!(self.peek_at(1), Some(b'+' | b'-')));
            if matches!(self.peek_at(1 + sign), Some(b'0'..=b'9')) {
                self.pos += 1 + sign;
                while matches!(self.peek(), Some(b'0'..=b'9')) {
                    self.pos += 1;
                }
            }
        }

        let text = &self.src[start..self.pos];
        text.parse::<f64>()
            .map(TokenKind::Number)
            .map_err(|_| RuleError::syntax(format!("无效的数字 '{}'", text), Some(start)))
    }

    fn lex_ident(&mut self) -> TokenKind {
        let start = self.pos;
        while matches!(
            self.peek(),
            Some(b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_')
        ) {
            self.pos += 1;
        }
        TokenKind::Ident(self.src[start..self.pos].to_string())
    }

    fn lex_string(&mut self, quote: u8) -> Result<TokenKind> {
        let start = self.pos;
        self.pos += 1;
        let mut out = String::new();
        let mut chunk_start = self.pos;

        loop {
            match self.peek() {
                None => {
                    return Err(RuleError::syntax_with_suggestion(
                        "字符串缺少结束引号",
                        Some(start),
                        format!("在字符串末尾补上 {}", quote as char),
                    ));
                }
                Some(b) if b == quote => {
                    out.push_str(&self.src[chunk_start..self.pos]);
                    self.pos += 1;
                    return Ok(TokenKind::Str(out));
                }
                Some(b'\\') => {
                    out.push_str(&self.src[chunk_start..self.pos]);
                    match self.peek_at(1) {
                        Some(escaped @ (b'\\' | b'"' | b'\'')) => {
                            out.push(escaped as char);
                            self.pos += 2;
                            chunk_start = self.pos;
                        }
                        _ => {
                            return Err(RuleError::syntax(
                                "字符串中只支持 \\\\、\\\" 和 \\' 转义",
                                Some(self.pos),
                            ));
                        }
                    }
                }
                Some(_) => self.pos += 1,
            }
        }
    }

    fn lex_operator(&mut self, byte: u8) -> Result<TokenKind> {
        let start = self.pos;
        let next = self.peek_at(1);

        let (kind, width) = match (byte, next) {
            (b'*', Some(b'*')) => (TokenKind::DoubleStar, 2),
            (b'/', Some(b'/')) => (TokenKind::DoubleSlash, 2),
            (b'=', Some(b'=')) => (TokenKind::EqEq, 2),
            (b'!', Some(b'=')) => (TokenKind::NotEq, 2),
            (b'<', Some(b'=')) => (TokenKind::Le, 2),
            (b'>', Some(b'=')) => (TokenKind::Ge, 2),
            (b'&', Some(b'&')) => (TokenKind::AndAnd, 2),
            (b'|', Some(b'|')) => (TokenKind::OrOr, 2),
            // 复合赋值：+= -= *= /= %= :=
            (b'+' | b'-' | b'*' | b'/' | b'%' | b':', Some(b'=')) => {
                return Err(Self::assignment_error(start));
            }
            (b'=', _) => return Err(Self::assignment_error(start)),
            (b'+', _) => (TokenKind::Plus, 1),
            (b'-', _) => (TokenKind::Minus, 1),
            (b'*', _) => (TokenKind::Star, 1),
            (b'/', _) => (TokenKind::Slash, 1),
            (b'%', _) => (TokenKind::Percent, 1),
            (b'<', _) => (TokenKind::Lt, 1),
            (b'>', _) => (TokenKind::Gt, 1),
            (b'!', _) => (TokenKind::Bang, 1),
            (b'?', _) => (TokenKind::Question, 1),
            (b':', _) => (TokenKind::Colon, 1),
            (b'.', _) => (TokenKind::Dot, 1),
            (b',', _) => (TokenKind::Comma, 1),
            (b'(', _) => (TokenKind::LParen, 1),
            (b')', _) => (TokenKind::RParen, 1),
            (b'[' | b']', _) => {
                return Err(RuleError::syntax_with_suggestion(
                    "不支持下标访问或列表字面量",
                    Some(start),
                    "使用点号访问字段，例如 cpu.cpu_mark_multi",
                ));
            }
            (b'{' | b'}', _) => {
                return Err(RuleError::syntax(
                    "不支持字典或代码块字面量",
                    Some(start),
                ));
            }
            (b';', _) => {
                return Err(RuleError::syntax_with_suggestion(
                    "公式只能包含单个表达式",
                    Some(start),
                    "删除分号，把多步计算合并为一个表达式",
                ));
            }
            _ => {
                let ch = self.src[start..].chars().next().unwrap_or('?');
                return Err(RuleError::syntax(
                    format!("无法识别的字符 '{}'", ch),
                    Some(start),
                ));
            }
        };

        self.pos += width;
        Ok(kind)
    }

    fn assignment_error(pos: usize) -> RuleError {
        RuleError::syntax_with_suggestion(
            "公式中不允许赋值",
            Some(pos),
            "比较相等请使用 ==",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_tokenize_arithmetic() {
        assert_eq!(
            kinds("ram_gb * 2.5 + 1e3"),
            vec![
                TokenKind::Ident("ram_gb".into()),
                TokenKind::Star,
                TokenKind::Number(2.5),
                TokenKind::Plus,
                TokenKind::Number(1000.0),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_tokenize_compound_operators() {
        assert_eq!(
            kinds("a ** 2 // 3 >= b != c"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::DoubleStar,
                TokenKind::Number(2.0),
                TokenKind::DoubleSlash,
                TokenKind::Number(3.0),
                TokenKind::Ge,
                TokenKind::Ident("b".into()),
                TokenKind::NotEq,
                TokenKind::Ident("c".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_tokenize_strings_with_escapes() {
        assert_eq!(
            kinds(r#"'new' "it\"s""#),
            vec![
                TokenKind::Str("new".into()),
                TokenKind::Str("it\"s".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_dotted_path_tokens() {
        assert_eq!(
            kinds("cpu.cpu_mark_multi"),
            vec![
                TokenKind::Ident("cpu".into()),
                TokenKind::Dot,
                TokenKind::Ident("cpu_mark_multi".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_assignment_rejected() {
        for src in ["x = 1", "x += 1", "x := 1"] {
            let err = Lexer::new(src).tokenize().unwrap_err();
            assert_eq!(err.code(), "SYNTAX_ERROR", "{}", src);
            assert!(err.to_string().contains("赋值"), "{}", src);
        }
    }

    #[test]
    fn test_subscripts_and_statements_rejected() {
        assert!(Lexer::new("a[0]").tokenize().is_err());
        assert!(Lexer::new("{}").tokenize().is_err());
        assert!(Lexer::new("a; b").tokenize().is_err());
        assert!(Lexer::new("a @ b").tokenize().is_err());
    }

    #[test]
    fn test_unterminated_string_position() {
        match Lexer::new("x == 'abc").tokenize().unwrap_err() {
            RuleError::Syntax { position, .. } => assert_eq!(position, Some(5)),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}

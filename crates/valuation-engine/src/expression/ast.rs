//! 公式表达式树
//!
//! 变体集合即沙箱边界：树中没有赋值、lambda、导入、下标或任意函数调用的表示，
//! 函数调用只能指向 [`Function`] 中列出的纯数值函数。

use std::collections::BTreeSet;
use std::fmt;

/// 允许调用的纯数值函数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    Min,
    Max,
    Round,
    Abs,
    Sqrt,
    Clamp,
    Floor,
    Ceil,
}

impl Function {
    pub const ALL: [Function; 8] = [
        Function::Min,
        Function::Max,
        Function::Round,
        Function::Abs,
        Function::Sqrt,
        Function::Clamp,
        Function::Floor,
        Function::Ceil,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "round" => Some(Self::Round),
            "abs" => Some(Self::Abs),
            "sqrt" => Some(Self::Sqrt),
            "clamp" => Some(Self::Clamp),
            "floor" => Some(Self::Floor),
            "ceil" => Some(Self::Ceil),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Min => "min",
            Self::Max => "max",
            Self::Round => "round",
            Self::Abs => "abs",
            Self::Sqrt => "sqrt",
            Self::Clamp => "clamp",
            Self::Floor => "floor",
            Self::Ceil => "ceil",
        }
    }

    /// 参数个数范围 (最少, 最多)，最多为 None 表示可变参数
    pub fn arity(&self) -> (usize, Option<usize>) {
        match self {
            Self::Min | Self::Max => (1, None),
            Self::Round => (1, Some(2)),
            Self::Abs | Self::Sqrt | Self::Floor | Self::Ceil => (1, Some(1)),
            Self::Clamp => (3, Some(3)),
        }
    }

    /// 允许列表，用于错误提示
    pub fn allow_list() -> String {
        Self::ALL
            .iter()
            .map(|f| f.name())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

impl BinaryOp {
    /// 右操作数为零时会失败的运算
    pub fn is_division(&self) -> bool {
        matches!(self, Self::Div | Self::FloorDiv | Self::Mod)
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "**",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

/// 点号字段引用
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRef {
    pub segments: Vec<String>,
    pub pos: usize,
}

impl FieldRef {
    pub fn dotted(&self) -> String {
        self.segments.join(".")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Bool(bool),
    Str(String),
    Field(FieldRef),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        pos: usize,
    },
    Compare {
        op: CompareOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Conditional {
        condition: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },
    Call {
        function: Function,
        args: Vec<Expr>,
        pos: usize,
    },
}

impl Expr {
    /// 直接子节点
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Number(_) | Expr::Bool(_) | Expr::Str(_) | Expr::Field(_) => Vec::new(),
            Expr::Unary { operand, .. } => vec![operand.as_ref()],
            Expr::Binary { lhs, rhs, .. }
            | Expr::Compare { lhs, rhs, .. }
            | Expr::Logical { lhs, rhs, .. } => vec![lhs.as_ref(), rhs.as_ref()],
            Expr::Conditional {
                condition,
                then_branch,
                else_branch,
            } => vec![condition.as_ref(), then_branch.as_ref(), else_branch.as_ref()],
            Expr::Call { args, .. } => args.iter().collect(),
        }
    }

    /// 树高度，叶子为 1
    pub fn depth(&self) -> usize {
        1 + self
            .children()
            .into_iter()
            .map(Expr::depth)
            .max()
            .unwrap_or(0)
    }

    /// 只读遍历，收集所有引用的字段路径
    pub fn referenced_fields(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields(&self, out: &mut BTreeSet<String>) {
        if let Expr::Field(field) = self {
            out.insert(field.dotted());
        }
        for child in self.children() {
            child.collect_fields(out);
        }
    }

    /// 不引用任何字段的常量表达式
    pub fn is_constant(&self) -> bool {
        match self {
            Expr::Field(_) => false,
            _ => self.children().into_iter().all(Expr::is_constant),
        }
    }
}

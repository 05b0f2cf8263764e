//! 条件树
//!
//! 内存中以 arena 存储：所有节点放在一个 `Vec` 中，组节点只保存子节点下标。
//! 叶子节点在类型上就没有子节点字段，因此“叶子不含子节点”天然成立。
//!
//! 序列化时使用嵌套的 `{"type": "condition" | "group", ...}` 文档形式，
//! 与规则包和编辑界面交换的格式一致。

use crate::operators::{LogicalOperator, Operator};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 条件节点在 arena 中的下标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// 字段类型，决定比较时的类型转换
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    #[default]
    String,
    Number,
    Boolean,
    Enum,
    Custom,
}

/// 叶子条件：字段 + 操作符 + 期望值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionLeaf {
    /// 点号分隔的字段路径
    pub field_name: String,
    #[serde(default)]
    pub field_type: FieldType,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
    /// 字符串比较时忽略大小写
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub case_insensitive: bool,
}

impl ConditionLeaf {
    pub fn new(field_name: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            field_name: field_name.into(),
            field_type: FieldType::default(),
            operator,
            value: value.into(),
            case_insensitive: false,
        }
    }

    pub fn with_field_type(mut self, field_type: FieldType) -> Self {
        self.field_type = field_type;
        self
    }

    pub fn case_insensitive(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    /// 人类可读的条件文本，用于审计追踪
    pub fn describe(&self) -> String {
        format!("{} {} {}", self.field_name, self.operator.symbol(), self.value)
    }
}

/// arena 中的节点
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionNode {
    Leaf(ConditionLeaf),
    Group {
        operator: LogicalOperator,
        children: Vec<NodeId>,
    },
}

/// 嵌套文档形式的条件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionSpec {
    Condition(ConditionLeaf),
    Group(GroupSpec),
}

/// 嵌套文档形式的逻辑组
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub operator: LogicalOperator,
    #[serde(default)]
    pub children: Vec<ConditionSpec>,
}

impl ConditionSpec {
    pub fn leaf(field_name: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self::Condition(ConditionLeaf::new(field_name, operator, value))
    }

    pub fn and(children: Vec<ConditionSpec>) -> Self {
        Self::Group(GroupSpec {
            operator: LogicalOperator::And,
            children,
        })
    }

    pub fn or(children: Vec<ConditionSpec>) -> Self {
        Self::Group(GroupSpec {
            operator: LogicalOperator::Or,
            children,
        })
    }
}

impl From<ConditionLeaf> for ConditionSpec {
    fn from(leaf: ConditionLeaf) -> Self {
        Self::Condition(leaf)
    }
}

/// 条件树
///
/// 根节点为空表示“无条件”，评估恒为真。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Option<ConditionSpec>", into = "Option<ConditionSpec>")]
pub struct ConditionTree {
    nodes: Vec<ConditionNode>,
    root: Option<NodeId>,
}

impl ConditionTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从嵌套文档构建 arena
    pub fn from_spec(spec: ConditionSpec) -> Self {
        let mut tree = Self::new();
        let root = tree.push_spec(spec);
        tree.root = Some(root);
        tree
    }

    /// 只有一个叶子的树
    pub fn leaf(leaf: ConditionLeaf) -> Self {
        Self::from_spec(ConditionSpec::Condition(leaf))
    }

    /// 所有条件都需满足
    pub fn all(children: Vec<ConditionSpec>) -> Self {
        Self::from_spec(ConditionSpec::and(children))
    }

    /// 任一条件满足即可
    pub fn any(children: Vec<ConditionSpec>) -> Self {
        Self::from_spec(ConditionSpec::or(children))
    }

    fn push_spec(&mut self, spec: ConditionSpec) -> NodeId {
        match spec {
            ConditionSpec::Condition(leaf) => self.push_leaf(leaf),
            ConditionSpec::Group(group) => {
                let children = group
                    .children
                    .into_iter()
                    .map(|child| self.push_spec(child))
                    .collect();
                self.push_node(ConditionNode::Group {
                    operator: group.operator,
                    children,
                })
            }
        }
    }

    fn push_node(&mut self, node: ConditionNode) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    fn contains(&self, id: NodeId) -> bool {
        id.0 < self.nodes.len()
    }

    pub fn push_leaf(&mut self, leaf: ConditionLeaf) -> NodeId {
        self.push_node(ConditionNode::Leaf(leaf))
    }

    /// 追加逻辑组，任一子节点不在 arena 中时返回 `None`
    pub fn push_group(&mut self, operator: LogicalOperator, children: Vec<NodeId>) -> Option<NodeId> {
        if !children.iter().all(|c| self.contains(*c)) {
            return None;
        }
        Some(self.push_node(ConditionNode::Group { operator, children }))
    }

    /// 设置根节点，节点不在 arena 中时不做改动并返回 false
    pub fn set_root(&mut self, root: NodeId) -> bool {
        if !self.contains(root) {
            return false;
        }
        self.root = Some(root);
        true
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn node(&self, id: NodeId) -> Option<&ConditionNode> {
        self.nodes.get(id.0)
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// 从组节点中移除一个子节点引用，节点本身仍保留在 arena 中
    pub fn remove_child(&mut self, group: NodeId, child: NodeId) -> bool {
        match self.nodes.get_mut(group.0) {
            Some(ConditionNode::Group { children, .. }) => {
                let before = children.len();
                children.retain(|c| *c != child);
                before != children.len()
            }
            _ => false,
        }
    }

    /// 从根可达的所有叶子
    pub fn leaves(&self) -> Vec<&ConditionLeaf> {
        let mut out = Vec::new();
        if let Some(root) = self.root {
            self.collect_leaves(root, &mut out);
        }
        out
    }

    fn collect_leaves<'a>(&'a self, id: NodeId, out: &mut Vec<&'a ConditionLeaf>) {
        match self.node(id) {
            Some(ConditionNode::Leaf(leaf)) => out.push(leaf),
            Some(ConditionNode::Group { children, .. }) => {
                for child in children {
                    self.collect_leaves(*child, out);
                }
            }
            None => {}
        }
    }

    /// 转回嵌套文档形式
    pub fn to_spec(&self) -> Option<ConditionSpec> {
        self.root.and_then(|root| self.node_to_spec(root))
    }

    fn node_to_spec(&self, id: NodeId) -> Option<ConditionSpec> {
        let spec = match self.node(id)? {
            ConditionNode::Leaf(leaf) => ConditionSpec::Condition(leaf.clone()),
            ConditionNode::Group { operator, children } => ConditionSpec::Group(GroupSpec {
                operator: *operator,
                children: children.iter().filter_map(|c| self.node_to_spec(*c)).collect(),
            }),
        };
        Some(spec)
    }

    /// 从根到最深叶子的层数
    pub fn depth(&self) -> usize {
        self.root.map(|root| self.node_depth(root)).unwrap_or(0)
    }

    fn node_depth(&self, id: NodeId) -> usize {
        match self.node(id) {
            Some(ConditionNode::Leaf(_)) => 1,
            Some(ConditionNode::Group { children, .. }) => {
                1 + children
                    .iter()
                    .map(|c| self.node_depth(*c))
                    .max()
                    .unwrap_or(0)
            }
            None => 0,
        }
    }
}

impl From<Option<ConditionSpec>> for ConditionTree {
    fn from(spec: Option<ConditionSpec>) -> Self {
        spec.map(Self::from_spec).unwrap_or_default()
    }
}

impl From<ConditionTree> for Option<ConditionSpec> {
    fn from(tree: ConditionTree) -> Self {
        tree.to_spec()
    }
}

impl From<ConditionSpec> for ConditionTree {
    fn from(spec: ConditionSpec) -> Self {
        Self::from_spec(spec)
    }
}

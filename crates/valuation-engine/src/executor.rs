//! 条件树执行器
//!
//! 对条件树做短路求值，并在旁路记录审计追踪。
//! 追踪只是附带输出，开启与否都不会改变求值结果。

use crate::conditions::{ConditionLeaf, ConditionNode, ConditionTree, NodeId};
use crate::context::{FieldSource, resolve};
use crate::evaluator::ConditionEvaluator;
use crate::operators::LogicalOperator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// 单个叶子条件的追踪记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionTrace {
    /// 条件文本，如 `ram_gb >= 32`
    pub text: String,
    pub matched: bool,
    /// 上下文中的实际值，字段缺失时为空
    pub actual: Option<Value>,
    pub expected: Value,
    /// 类型错误等降级原因
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// 带追踪的求值结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TreeEvaluation {
    pub matched: bool,
    pub trace: Vec<ConditionTrace>,
}

/// 条件树执行器
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionExecutor {
    /// 是否记录详细评估追踪
    trace_enabled: bool,
}

impl ConditionExecutor {
    pub fn new() -> Self {
        Self {
            trace_enabled: false,
        }
    }

    /// 启用评估追踪
    pub fn with_trace(mut self) -> Self {
        self.trace_enabled = true;
        self
    }

    pub fn trace_enabled(&self) -> bool {
        self.trace_enabled
    }

    /// 评估条件树，空树恒为真
    pub fn evaluate<S>(&self, tree: &ConditionTree, context: &S) -> bool
    where
        S: FieldSource + ?Sized,
    {
        match tree.root() {
            Some(root) => self.evaluate_node(tree, root, context, &mut None),
            None => true,
        }
    }

    /// 评估条件树并返回追踪
    pub fn evaluate_traced<S>(&self, tree: &ConditionTree, context: &S) -> TreeEvaluation
    where
        S: FieldSource + ?Sized,
    {
        let mut trace = if self.trace_enabled {
            Some(Vec::new())
        } else {
            None
        };

        let matched = match tree.root() {
            Some(root) => self.evaluate_node(tree, root, context, &mut trace),
            None => true,
        };

        TreeEvaluation {
            matched,
            trace: trace.unwrap_or_default(),
        }
    }

    /// 递归评估节点
    fn evaluate_node<S>(
        &self,
        tree: &ConditionTree,
        id: NodeId,
        context: &S,
        trace: &mut Option<Vec<ConditionTrace>>,
    ) -> bool
    where
        S: FieldSource + ?Sized,
    {
        match tree.node(id) {
            None => false,
            Some(ConditionNode::Leaf(leaf)) => self.evaluate_leaf(leaf, context, trace),
            Some(ConditionNode::Group { operator, children }) => {
                // 空组恒为真
                if children.is_empty() {
                    return true;
                }

                match operator {
                    // AND: 所有条件都必须满足，遇到 false 立即返回
                    LogicalOperator::And => children
                        .iter()
                        .all(|child| self.evaluate_node(tree, *child, context, trace)),
                    // OR: 任一条件满足即可，遇到 true 立即返回
                    LogicalOperator::Or => children
                        .iter()
                        .any(|child| self.evaluate_node(tree, *child, context, trace)),
                }
            }
        }
    }

    /// 评估叶子节点，任何错误都降级为不匹配
    fn evaluate_leaf<S>(
        &self,
        leaf: &ConditionLeaf,
        context: &S,
        trace: &mut Option<Vec<ConditionTrace>>,
    ) -> bool
    where
        S: FieldSource + ?Sized,
    {
        let field_value = resolve(context, &leaf.field_name);

        let (matched, note) = match ConditionEvaluator::evaluate_leaf(field_value, leaf) {
            Ok(matched) => {
                let note = field_value
                    .is_none()
                    .then(|| format!("字段 {} 不存在", leaf.field_name));
                (matched, note)
            }
            Err(e) => {
                debug!(field = %leaf.field_name, error = %e, "条件求值降级为不匹配");
                (false, Some(e.to_string()))
            }
        };

        if let Some(trace) = trace.as_mut() {
            trace.push(ConditionTrace {
                text: leaf.describe(),
                matched,
                actual: field_value.cloned(),
                expected: leaf.value.clone(),
                note,
            });
        }

        matched
    }
}

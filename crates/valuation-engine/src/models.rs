//! 估值规则领域模型

use crate::action::Action;
use crate::conditions::ConditionTree;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 元数据中标记系统基线规则集的键
pub const SYSTEM_BASELINE_KEY: &str = "system_baseline";
/// 元数据中标记占位规则的键
pub const PLACEHOLDER_KEY: &str = "placeholder";
/// 元数据中的展开配置
pub const HYDRATION_KEY: &str = "hydration";
/// 展开后的规则记录来源占位规则
pub const HYDRATION_SOURCE_KEY: &str = "hydration_source_rule_id";

fn default_true() -> bool {
    true
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_weight() -> f64 {
    1.0
}

fn default_rule_priority() -> i32 {
    100
}

/// 规则集
///
/// 版本化的规则组容器。被审计记录引用后只做软停用，不物理删除。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ruleset {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// 语义化版本号
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// 激活条件，为空时对所有商品生效
    #[serde(default)]
    pub conditions: ConditionTree,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub rule_groups: Vec<RuleGroup>,
}

impl Ruleset {
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            name: name.into(),
            description: None,
            version: default_version(),
            priority,
            is_active: true,
            conditions: ConditionTree::new(),
            metadata: Map::new(),
            created_by: None,
            created_at: now,
            updated_at: now,
            rule_groups: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }

    pub fn with_group(mut self, group: RuleGroup) -> Self {
        self.rule_groups.push(group);
        self
    }

    pub fn with_conditions(mut self, conditions: ConditionTree) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// 元数据显式标记为系统基线
    pub fn is_system_baseline(&self) -> bool {
        self.metadata
            .get(SYSTEM_BASELINE_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// 所有规则（含停用组中的规则）
    pub fn rules(&self) -> impl Iterator<Item = (&RuleGroup, &Rule)> {
        self.rule_groups
            .iter()
            .flat_map(|group| group.rules.iter().map(move |rule| (group, rule)))
    }

    pub fn rule_count(&self) -> usize {
        self.rule_groups.iter().map(|g| g.rules.len()).sum()
    }

    pub fn find_group(&self, name: &str) -> Option<&RuleGroup> {
        self.rule_groups.iter().find(|g| g.name == name)
    }
}

/// 规则组
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleGroup {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub ruleset_id: i64,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub display_order: i32,
    /// 报表权重 [0, 1]，不参与调整额计算
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl RuleGroup {
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            id: 0,
            ruleset_id: 0,
            name: name.into(),
            category: category.into(),
            description: None,
            display_order: 0,
            weight: default_weight(),
            is_active: true,
            metadata: Map::new(),
            rules: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn find_rule(&self, name: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.name == name)
    }
}

/// 定价规则
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub group_id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// 数值越小越先执行
    #[serde(default = "default_rule_priority")]
    pub priority: i32,
    #[serde(default)]
    pub evaluation_order: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub conditions: ConditionTree,
    #[serde(default)]
    pub actions: Vec<Action>,
    /// 来源与分类标记，如展开来源、占位标记
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            group_id: 0,
            name: name.into(),
            description: None,
            priority: default_rule_priority(),
            evaluation_order: 0,
            is_active: true,
            conditions: ConditionTree::new(),
            actions: Vec::new(),
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_conditions(mut self, conditions: ConditionTree) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// 等待展开的占位规则
    pub fn is_placeholder(&self) -> bool {
        self.metadata
            .get(PLACEHOLDER_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// 由哪条占位规则展开而来
    pub fn hydration_source(&self) -> Option<i64> {
        self.metadata.get(HYDRATION_SOURCE_KEY).and_then(Value::as_i64)
    }

    /// 执行顺序键
    pub fn sort_key(&self) -> (i32, i32, i64) {
        (self.priority, self.evaluation_order, self.id)
    }
}

/// 自定义字段定义
///
/// 在条件与公式中以 `custom.<key>` 引用。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomFieldDefinition {
    #[serde(default)]
    pub id: i64,
    /// 所属实体，如 `listing`
    pub entity: String,
    pub key: String,
    #[serde(default)]
    pub label: String,
    #[serde(default = "default_data_type")]
    pub data_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub display_order: i32,
}

fn default_data_type() -> String {
    "string".to_string()
}

impl CustomFieldDefinition {
    pub fn new(entity: impl Into<String>, key: impl Into<String>, data_type: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            id: 0,
            entity: entity.into(),
            label: key.clone(),
            key,
            data_type: data_type.into(),
            options: Vec::new(),
            required: false,
            is_active: true,
            display_order: 0,
        }
    }

    /// 在上下文中的引用路径
    pub fn reference(&self) -> String {
        format!("custom.{}", self.key)
    }
}

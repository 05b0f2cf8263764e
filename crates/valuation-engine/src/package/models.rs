//! 规则包数据模型
//!
//! 包是扁平的 JSON 文档：规则组通过 `ruleset_name`、规则通过
//! `ruleset_name` + `group_name` 关联，不携带任何目录 id。

use crate::action::Action;
use crate::conditions::ConditionTree;
use crate::error::{Result, RuleError};
use crate::expression::FormulaEngine;
use crate::models::{CustomFieldDefinition, Rule, RuleGroup, Ruleset};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::path::Path;

/// 当前支持的包格式版本
pub const SCHEMA_VERSION: &str = "1.0";

/// 自定义字段在上下文中的前缀
pub const CUSTOM_FIELD_PREFIX: &str = "custom.";

fn default_schema_version() -> String {
    SCHEMA_VERSION.to_string()
}

fn default_true() -> bool {
    true
}

fn default_weight() -> f64 {
    1.0
}

/// 包元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageMetadata {
    pub name: String,
    /// 包自身的语义化版本
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// 安装所需的最低应用版本
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_app_version: Option<String>,
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl PackageMetadata {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            author: None,
            description: None,
            min_app_version: None,
            schema_version: default_schema_version(),
            created_at: Utc::now(),
        }
    }
}

/// 导出的规则集，不含下属规则组
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulesetExport {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub version: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub conditions: ConditionTree,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl From<&Ruleset> for RulesetExport {
    fn from(ruleset: &Ruleset) -> Self {
        Self {
            name: ruleset.name.clone(),
            description: ruleset.description.clone(),
            version: ruleset.version.clone(),
            priority: ruleset.priority,
            is_active: ruleset.is_active,
            conditions: ruleset.conditions.clone(),
            metadata: ruleset.metadata.clone(),
        }
    }
}

impl RulesetExport {
    pub fn to_ruleset(&self) -> Ruleset {
        let mut ruleset = Ruleset::new(self.name.clone(), self.priority)
            .with_conditions(self.conditions.clone());
        ruleset.description = self.description.clone();
        ruleset.version = self.version.clone();
        ruleset.is_active = self.is_active;
        ruleset.metadata = self.metadata.clone();
        ruleset
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleGroupExport {
    pub ruleset_name: String,
    pub name: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub display_order: i32,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl RuleGroupExport {
    pub fn new(ruleset_name: &str, group: &RuleGroup) -> Self {
        Self {
            ruleset_name: ruleset_name.to_string(),
            name: group.name.clone(),
            category: group.category.clone(),
            description: group.description.clone(),
            display_order: group.display_order,
            weight: group.weight,
            is_active: group.is_active,
            metadata: group.metadata.clone(),
        }
    }

    pub fn to_group(&self) -> RuleGroup {
        let mut group = RuleGroup::new(self.name.clone(), self.category.clone());
        group.description = self.description.clone();
        group.display_order = self.display_order;
        group.weight = self.weight;
        group.is_active = self.is_active;
        group.metadata = self.metadata.clone();
        group
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleExport {
    pub ruleset_name: String,
    pub group_name: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub evaluation_order: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub conditions: ConditionTree,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl RuleExport {
    pub fn new(ruleset_name: &str, group_name: &str, rule: &Rule) -> Self {
        Self {
            ruleset_name: ruleset_name.to_string(),
            group_name: group_name.to_string(),
            name: rule.name.clone(),
            description: rule.description.clone(),
            priority: rule.priority,
            evaluation_order: rule.evaluation_order,
            is_active: rule.is_active,
            conditions: rule.conditions.clone(),
            actions: rule.actions.clone(),
            metadata: rule.metadata.clone(),
        }
    }

    pub fn to_rule(&self) -> Rule {
        let mut rule = Rule::new(self.name.clone())
            .with_priority(self.priority)
            .with_conditions(self.conditions.clone());
        rule.description = self.description.clone();
        rule.evaluation_order = self.evaluation_order;
        rule.is_active = self.is_active;
        rule.actions = self.actions.clone();
        rule.metadata = self.metadata.clone();
        rule
    }
}

/// 随包分发的示例商品
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageExample {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub context: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_adjustment: Option<f64>,
}

/// 规则包
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub metadata: PackageMetadata,
    #[serde(default)]
    pub rulesets: Vec<RulesetExport>,
    #[serde(default)]
    pub rule_groups: Vec<RuleGroupExport>,
    #[serde(default)]
    pub rules: Vec<RuleExport>,
    #[serde(default)]
    pub custom_field_definitions: Vec<CustomFieldDefinition>,
    #[serde(default)]
    pub examples: Vec<PackageExample>,
}

impl Package {
    /// 解析包文档，格式版本不受支持时直接拒绝
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(json)?;
        let schema = raw
            .get("metadata")
            .and_then(|m| m.get("schema_version"))
            .and_then(Value::as_str)
            .unwrap_or(SCHEMA_VERSION);

        if schema != SCHEMA_VERSION {
            return Err(RuleError::Compatibility(format!(
                "不支持的包格式版本 {}，当前支持 {}",
                schema, SCHEMA_VERSION
            )));
        }

        Ok(serde_json::from_value(raw)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json_pretty()?)?;
        Ok(())
    }

    pub fn read_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// 按规则集重新组装嵌套结构
    ///
    /// 找不到所属规则集或规则组的记录视为包损坏。
    pub fn assemble(&self) -> Result<Vec<Ruleset>> {
        let mut rulesets: Vec<Ruleset> = self.rulesets.iter().map(RulesetExport::to_ruleset).collect();

        for export in &self.rule_groups {
            let ruleset = rulesets
                .iter_mut()
                .find(|r| r.name == export.ruleset_name)
                .ok_or_else(|| {
                    RuleError::InvalidPackage(format!(
                        "规则组 '{}' 引用了不存在的规则集 '{}'",
                        export.name, export.ruleset_name
                    ))
                })?;
            ruleset.rule_groups.push(export.to_group());
        }

        for export in &self.rules {
            let group = rulesets
                .iter_mut()
                .find(|r| r.name == export.ruleset_name)
                .and_then(|r| r.rule_groups.iter_mut().find(|g| g.name == export.group_name))
                .ok_or_else(|| {
                    RuleError::InvalidPackage(format!(
                        "规则 '{}' 引用了不存在的规则组 '{}.{}'",
                        export.name, export.ruleset_name, export.group_name
                    ))
                })?;
            group.rules.push(export.to_rule());
        }

        Ok(rulesets)
    }

    /// 条件与动作中引用的自定义字段键
    pub fn referenced_custom_fields(&self) -> BTreeSet<String> {
        let formulas = FormulaEngine::new();
        let mut fields: Vec<String> = Vec::new();

        for ruleset in &self.rulesets {
            fields.extend(ruleset.conditions.leaves().into_iter().map(|l| l.field_name.clone()));
        }
        for rule in &self.rules {
            fields.extend(rule.conditions.leaves().into_iter().map(|l| l.field_name.clone()));
            for action in &rule.actions {
                fields.extend(action.referenced_fields(&formulas));
            }
        }

        fields.iter().filter_map(|f| custom_field_key(f)).collect()
    }
}

/// `custom.warranty_months.value` → `warranty_months`
pub fn custom_field_key(path: &str) -> Option<String> {
    path.strip_prefix(CUSTOM_FIELD_PREFIX)
        .and_then(|rest| rest.split('.').next())
        .filter(|key| !key.is_empty())
        .map(str::to_string)
}

/// 规则包构建器
#[derive(Debug, Clone)]
pub struct PackageBuilder {
    package: Package,
    active_only: bool,
}

impl PackageBuilder {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self::with_metadata(PackageMetadata::new(name, version))
    }

    pub fn with_metadata(metadata: PackageMetadata) -> Self {
        Self {
            package: Package {
                metadata,
                rulesets: Vec::new(),
                rule_groups: Vec::new(),
                rules: Vec::new(),
                custom_field_definitions: Vec::new(),
                examples: Vec::new(),
            },
            active_only: false,
        }
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.package.metadata.author = Some(author.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.package.metadata.description = Some(description.into());
        self
    }

    pub fn min_app_version(mut self, version: impl Into<String>) -> Self {
        self.package.metadata.min_app_version = Some(version.into());
        self
    }

    /// 只导出启用的规则组与规则
    pub fn active_only(mut self, active_only: bool) -> Self {
        self.active_only = active_only;
        self
    }

    pub fn ruleset(mut self, ruleset: &Ruleset) -> Self {
        self.package.rulesets.push(RulesetExport::from(ruleset));

        for group in &ruleset.rule_groups {
            if self.active_only && !group.is_active {
                continue;
            }
            self.package
                .rule_groups
                .push(RuleGroupExport::new(&ruleset.name, group));

            for rule in &group.rules {
                if self.active_only && !rule.is_active {
                    continue;
                }
                self.package
                    .rules
                    .push(RuleExport::new(&ruleset.name, &group.name, rule));
            }
        }
        self
    }

    pub fn custom_field(mut self, field: &CustomFieldDefinition) -> Self {
        let mut field = field.clone();
        field.id = 0;
        self.package.custom_field_definitions.push(field);
        self
    }

    pub fn example(mut self, example: PackageExample) -> Self {
        self.package.examples.push(example);
        self
    }

    pub fn build(self) -> Package {
        self.package
    }
}

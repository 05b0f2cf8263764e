//! 规则变更审计
//!
//! 目录的每次变更都追加一条带完整快照的版本记录。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// 被审计的实体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Ruleset,
    RuleGroup,
    Rule,
    CustomField,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityType::Ruleset => "ruleset",
            EntityType::RuleGroup => "rule_group",
            EntityType::Rule => "rule",
            EntityType::CustomField => "custom_field",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

/// 版本记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleVersion {
    pub entity_type: EntityType,
    pub entity_id: i64,
    /// 同一实体内从 1 递增
    pub version: u32,
    pub change_type: ChangeType,
    pub snapshot: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_by: Option<String>,
    pub changed_at: DateTime<Utc>,
}

/// 只追加的审计日志
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditLog {
    records: Vec<RuleVersion>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一条记录并返回其版本号
    pub fn record<T: Serialize>(
        &mut self,
        entity_type: EntityType,
        entity_id: i64,
        change_type: ChangeType,
        snapshot: &T,
        changed_by: Option<&str>,
    ) -> u32 {
        let version = self
            .latest(entity_type, entity_id)
            .map(|r| r.version + 1)
            .unwrap_or(1);

        self.records.push(RuleVersion {
            entity_type,
            entity_id,
            version,
            change_type,
            snapshot: serde_json::to_value(snapshot).unwrap_or(Value::Null),
            changed_by: changed_by.map(str::to_string),
            changed_at: Utc::now(),
        });
        version
    }

    /// 某实体的全部历史，按版本升序
    pub fn history(&self, entity_type: EntityType, entity_id: i64) -> Vec<&RuleVersion> {
        self.records
            .iter()
            .filter(|r| r.entity_type == entity_type && r.entity_id == entity_id)
            .collect()
    }

    pub fn latest(&self, entity_type: EntityType, entity_id: i64) -> Option<&RuleVersion> {
        self.records
            .iter()
            .rev()
            .find(|r| r.entity_type == entity_type && r.entity_id == entity_id)
    }

    /// 是否被审计记录引用，被引用的实体只能软停用
    pub fn references(&self, entity_type: EntityType, entity_id: i64) -> bool {
        self.latest(entity_type, entity_id).is_some()
    }

    pub fn records(&self) -> &[RuleVersion] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

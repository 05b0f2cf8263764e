//! 规则包安装
//!
//! 按自然键合并：规则集按名称，规则组按 规则集+名称，规则按 规则组+名称，
//! 自定义字段按 实体+键。整个包在目录副本上安装，任一步失败则什么都不落地。

use super::compatibility::{CompatibilityReport, validate_compatibility};
use super::models::Package;
use crate::audit::EntityType;
use crate::compiler::RulesetCompiler;
use crate::error::{Result, RuleError};
use crate::store::{Catalog, CatalogStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use tracing::{info, instrument, warn};

/// 同名实体已存在时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// 原地覆盖可变字段，保留 id 与从属关系
    Replace,
    /// 保持现有实体不变
    Skip,
}

impl MergeStrategy {
    /// 解析可选的策略参数，缺失同样视为冲突
    pub fn parse(value: Option<&str>) -> Result<Self> {
        match value {
            Some(s) => s.parse(),
            None => Err(RuleError::MergeConflict(
                "未指定合并策略，可选 replace 或 skip".to_string(),
            )),
        }
    }
}

impl FromStr for MergeStrategy {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(Self::Replace),
            "skip" => Ok(Self::Skip),
            other => Err(RuleError::MergeConflict(format!(
                "未知的合并策略 '{}'，可选 replace 或 skip",
                other
            ))),
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replace => write!(f, "replace"),
            Self::Skip => write!(f, "skip"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallOutcome {
    Created,
    Updated,
    Skipped,
}

/// 单个实体的处理结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallAction {
    pub entity_type: EntityType,
    pub entity_id: i64,
    /// 自然键，如 `Workstations/Memory/Large RAM`
    pub key: String,
    pub outcome: InstallOutcome,
}

/// 安装报告
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstallReport {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub actions: Vec<InstallAction>,
    /// 安装时观察到的兼容性警告
    pub warnings: Vec<String>,
}

impl InstallReport {
    fn push(&mut self, entity_type: EntityType, entity_id: i64, key: String, outcome: InstallOutcome) {
        match outcome {
            InstallOutcome::Created => self.created += 1,
            InstallOutcome::Updated => self.updated += 1,
            InstallOutcome::Skipped => self.skipped += 1,
        }
        self.actions.push(InstallAction {
            entity_type,
            entity_id,
            key,
            outcome,
        });
    }

    pub fn total(&self) -> usize {
        self.created + self.updated + self.skipped
    }
}

/// 规则包安装器
#[derive(Debug, Default)]
pub struct PackageInstaller {
    compiler: RulesetCompiler,
    app_version: String,
    actor: Option<String>,
}

impl PackageInstaller {
    pub fn new(app_version: impl Into<String>) -> Self {
        Self {
            compiler: RulesetCompiler::new(),
            app_version: app_version.into(),
            actor: None,
        }
    }

    /// 审计记录中的操作人
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn check(&self, package: &Package, catalog: &Catalog) -> CompatibilityReport {
        let available: BTreeSet<String> = catalog.custom_fields().map(|f| f.reference()).collect();
        validate_compatibility(package, &self.app_version, &available)
    }

    /// 安装规则包
    ///
    /// 先整体校验包内规则集，再在目录副本上合并，成功后一次性提交。
    #[instrument(skip(self, store, package), fields(package = %package.metadata.name))]
    pub fn install(&self, store: &CatalogStore, package: &Package, strategy: MergeStrategy) -> Result<InstallReport> {
        for ruleset in package.assemble()? {
            self.compiler.validate_ruleset(&ruleset)?;
        }

        let report = store.transaction(|catalog| {
            let mut report = InstallReport {
                warnings: self.check(package, catalog).warnings,
                ..Default::default()
            };
            self.merge(catalog, package, strategy, &mut report)?;
            Ok(report)
        })?;

        for warning in &report.warnings {
            warn!(warning = %warning, "规则包兼容性警告");
        }
        info!(
            created = report.created,
            updated = report.updated,
            skipped = report.skipped,
            "规则包已安装"
        );
        Ok(report)
    }

    fn merge(
        &self,
        catalog: &mut Catalog,
        package: &Package,
        strategy: MergeStrategy,
        report: &mut InstallReport,
    ) -> Result<()> {
        let actor = self.actor.as_deref();

        for field in &package.custom_field_definitions {
            let key = format!("{}.{}", field.entity, field.key);
            let existing = catalog.custom_field(&field.entity, &field.key).map(|f| f.id);
            match (existing, strategy) {
                (Some(id), MergeStrategy::Skip) => {
                    report.push(EntityType::CustomField, id, key, InstallOutcome::Skipped)
                }
                (Some(id), MergeStrategy::Replace) => {
                    catalog.replace_custom_field(id, field, actor)?;
                    report.push(EntityType::CustomField, id, key, InstallOutcome::Updated);
                }
                (None, _) => {
                    let id = catalog.insert_custom_field(field.clone(), actor);
                    report.push(EntityType::CustomField, id, key, InstallOutcome::Created);
                }
            }
        }

        for export in &package.rulesets {
            let incoming = export.to_ruleset();
            let existing = catalog.ruleset_by_name(&export.name).map(|r| r.id);
            let ruleset_id = match (existing, strategy) {
                (Some(id), MergeStrategy::Skip) => {
                    report.push(EntityType::Ruleset, id, export.name.clone(), InstallOutcome::Skipped);
                    id
                }
                (Some(id), MergeStrategy::Replace) => {
                    catalog.replace_ruleset_fields(id, &incoming, actor)?;
                    report.push(EntityType::Ruleset, id, export.name.clone(), InstallOutcome::Updated);
                    id
                }
                (None, _) => {
                    let id = catalog.insert_ruleset(incoming, actor)?;
                    report.push(EntityType::Ruleset, id, export.name.clone(), InstallOutcome::Created);
                    id
                }
            };

            for group_export in package.rule_groups.iter().filter(|g| g.ruleset_name == export.name) {
                let key = format!("{}/{}", export.name, group_export.name);
                let incoming = group_export.to_group();
                let existing = find_group(catalog, ruleset_id, &group_export.name);
                let group_id = match (existing, strategy) {
                    (Some(id), MergeStrategy::Skip) => {
                        report.push(EntityType::RuleGroup, id, key.clone(), InstallOutcome::Skipped);
                        id
                    }
                    (Some(id), MergeStrategy::Replace) => {
                        catalog.replace_group_fields(ruleset_id, id, &incoming, actor)?;
                        report.push(EntityType::RuleGroup, id, key.clone(), InstallOutcome::Updated);
                        id
                    }
                    (None, _) => {
                        let id = catalog.insert_group(ruleset_id, incoming, actor)?;
                        report.push(EntityType::RuleGroup, id, key.clone(), InstallOutcome::Created);
                        id
                    }
                };

                for rule_export in package
                    .rules
                    .iter()
                    .filter(|r| r.ruleset_name == export.name && r.group_name == group_export.name)
                {
                    let rule_key = format!("{}/{}", key, rule_export.name);
                    let incoming = rule_export.to_rule();
                    let existing = find_rule(catalog, ruleset_id, group_id, &rule_export.name);
                    match (existing, strategy) {
                        (Some(id), MergeStrategy::Skip) => {
                            report.push(EntityType::Rule, id, rule_key, InstallOutcome::Skipped)
                        }
                        (Some(id), MergeStrategy::Replace) => {
                            catalog.replace_rule_fields(ruleset_id, group_id, id, &incoming, actor)?;
                            report.push(EntityType::Rule, id, rule_key, InstallOutcome::Updated);
                        }
                        (None, _) => {
                            let id = catalog.insert_rule(ruleset_id, group_id, incoming, actor)?;
                            report.push(EntityType::Rule, id, rule_key, InstallOutcome::Created);
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

fn find_group(catalog: &Catalog, ruleset_id: i64, name: &str) -> Option<i64> {
    catalog
        .ruleset(ruleset_id)
        .and_then(|r| r.find_group(name))
        .map(|g| g.id)
}

fn find_rule(catalog: &Catalog, ruleset_id: i64, group_id: i64, name: &str) -> Option<i64> {
    catalog
        .ruleset(ruleset_id)
        .and_then(|r| r.rule_groups.iter().find(|g| g.id == group_id))
        .and_then(|g| g.find_rule(name))
        .map(|r| r.id)
}

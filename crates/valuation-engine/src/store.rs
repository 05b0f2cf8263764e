//! 规则目录存储
//!
//! 规则集、规则组、规则和自定义字段定义的内存目录，附带审计日志。
//! 目录整体放在 `parking_lot::RwLock` 后面；批量变更在副本上进行，
//! 成功后一次性替换，读者不会看到中间状态。

use crate::audit::{AuditLog, ChangeType, EntityType, RuleVersion};
use crate::compiler::{CompiledRuleset, RulesetCompiler};
use crate::error::{Result, RuleError};
use crate::hydration::{self, HydrationReport};
use crate::models::{CustomFieldDefinition, Rule, RuleGroup, Ruleset};
use crate::service::RulesetRepository;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// 目录数据
///
/// 规则组与规则嵌套在所属规则集内，id 由目录统一分配。
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    rulesets: BTreeMap<i64, Ruleset>,
    custom_fields: BTreeMap<i64, CustomFieldDefinition>,
    audit: AuditLog,
    last_id: i64,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    pub fn ruleset(&self, id: i64) -> Option<&Ruleset> {
        self.rulesets.get(&id)
    }

    pub fn ruleset_by_name(&self, name: &str) -> Option<&Ruleset> {
        self.rulesets.values().find(|r| r.name == name)
    }

    pub fn rulesets(&self) -> impl Iterator<Item = &Ruleset> {
        self.rulesets.values()
    }

    pub fn custom_field(&self, entity: &str, key: &str) -> Option<&CustomFieldDefinition> {
        self.custom_fields
            .values()
            .find(|f| f.entity == entity && f.key == key)
    }

    pub fn custom_fields(&self) -> impl Iterator<Item = &CustomFieldDefinition> {
        self.custom_fields.values()
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// 插入规则集，为其本身及下属的组和规则分配新 id
    ///
    /// 规则集名称是规则包安装时的自然键，同名规则集直接拒绝。
    pub fn insert_ruleset(&mut self, mut ruleset: Ruleset, actor: Option<&str>) -> Result<i64> {
        if self.ruleset_by_name(&ruleset.name).is_some() {
            return Err(RuleError::validation(format!("规则集 '{}' 已存在", ruleset.name)));
        }

        let id = self.next_id();
        ruleset.id = id;
        if ruleset.created_by.is_none() {
            ruleset.created_by = actor.map(str::to_string);
        }

        let groups = std::mem::take(&mut ruleset.rule_groups);
        self.audit
            .record(EntityType::Ruleset, id, ChangeType::Created, &ruleset, actor);
        self.rulesets.insert(id, ruleset);

        for group in groups {
            // 刚插入的规则集一定存在
            let _ = self.insert_group(id, group, actor);
        }
        Ok(id)
    }

    /// 向规则集追加规则组
    pub fn insert_group(&mut self, ruleset_id: i64, mut group: RuleGroup, actor: Option<&str>) -> Result<i64> {
        if !self.rulesets.contains_key(&ruleset_id) {
            return Err(RuleError::RulesetNotFound(ruleset_id));
        }

        let group_id = self.next_id();
        group.id = group_id;
        group.ruleset_id = ruleset_id;

        let rules = std::mem::take(&mut group.rules);
        self.audit
            .record(EntityType::RuleGroup, group_id, ChangeType::Created, &group, actor);

        let mut assigned = Vec::with_capacity(rules.len());
        for mut rule in rules {
            rule.id = self.next_id();
            rule.group_id = group_id;
            self.audit
                .record(EntityType::Rule, rule.id, ChangeType::Created, &rule, actor);
            assigned.push(rule);
        }
        group.rules = assigned;

        if let Some(ruleset) = self.rulesets.get_mut(&ruleset_id) {
            ruleset.rule_groups.push(group);
        }
        Ok(group_id)
    }

    /// 向规则组追加规则
    pub fn insert_rule(
        &mut self,
        ruleset_id: i64,
        group_id: i64,
        mut rule: Rule,
        actor: Option<&str>,
    ) -> Result<i64> {
        let rule_id = self.next_id();
        rule.id = rule_id;
        rule.group_id = group_id;

        let group = self.group_mut(ruleset_id, group_id)?;
        group.rules.push(rule.clone());

        self.audit
            .record(EntityType::Rule, rule_id, ChangeType::Created, &rule, actor);
        Ok(rule_id)
    }

    /// 覆盖规则集的可变字段，保留 id、创建信息与下属规则组
    pub fn replace_ruleset_fields(&mut self, id: i64, incoming: &Ruleset, actor: Option<&str>) -> Result<()> {
        let ruleset = self
            .rulesets
            .get_mut(&id)
            .ok_or(RuleError::RulesetNotFound(id))?;

        ruleset.description = incoming.description.clone();
        ruleset.version = incoming.version.clone();
        ruleset.priority = incoming.priority;
        ruleset.is_active = incoming.is_active;
        ruleset.conditions = incoming.conditions.clone();
        ruleset.metadata = incoming.metadata.clone();
        ruleset.updated_at = Utc::now();

        let snapshot = ruleset.clone();
        self.audit
            .record(EntityType::Ruleset, id, ChangeType::Updated, &snapshot, actor);
        Ok(())
    }

    /// 覆盖规则组的可变字段，保留 id、所属关系与下属规则
    pub fn replace_group_fields(
        &mut self,
        ruleset_id: i64,
        group_id: i64,
        incoming: &RuleGroup,
        actor: Option<&str>,
    ) -> Result<()> {
        let group = self.group_mut(ruleset_id, group_id)?;

        group.category = incoming.category.clone();
        group.description = incoming.description.clone();
        group.display_order = incoming.display_order;
        group.weight = incoming.weight;
        group.is_active = incoming.is_active;
        group.metadata = incoming.metadata.clone();

        let mut snapshot = group.clone();
        snapshot.rules.clear();
        self.audit
            .record(EntityType::RuleGroup, group_id, ChangeType::Updated, &snapshot, actor);
        Ok(())
    }

    /// 覆盖规则的可变字段，保留 id、所属组与创建时间
    pub fn replace_rule_fields(
        &mut self,
        ruleset_id: i64,
        group_id: i64,
        rule_id: i64,
        incoming: &Rule,
        actor: Option<&str>,
    ) -> Result<()> {
        let group = self.group_mut(ruleset_id, group_id)?;
        let rule = group
            .rules
            .iter_mut()
            .find(|r| r.id == rule_id)
            .ok_or_else(|| RuleError::validation(format!("规则 {} 不在规则组 {} 中", rule_id, group_id)))?;

        rule.description = incoming.description.clone();
        rule.priority = incoming.priority;
        rule.evaluation_order = incoming.evaluation_order;
        rule.is_active = incoming.is_active;
        rule.conditions = incoming.conditions.clone();
        rule.actions = incoming.actions.clone();
        rule.metadata = incoming.metadata.clone();
        rule.updated_at = Utc::now();

        let snapshot = rule.clone();
        self.audit
            .record(EntityType::Rule, rule_id, ChangeType::Updated, &snapshot, actor);
        Ok(())
    }

    pub fn insert_custom_field(&mut self, mut field: CustomFieldDefinition, actor: Option<&str>) -> i64 {
        let id = self.next_id();
        field.id = id;
        self.audit
            .record(EntityType::CustomField, id, ChangeType::Created, &field, actor);
        self.custom_fields.insert(id, field);
        id
    }

    /// 覆盖自定义字段定义，保留 id 与自然键
    pub fn replace_custom_field(&mut self, id: i64, incoming: &CustomFieldDefinition, actor: Option<&str>) -> Result<()> {
        let field = self
            .custom_fields
            .get_mut(&id)
            .ok_or_else(|| RuleError::validation(format!("自定义字段 {} 不存在", id)))?;

        field.label = incoming.label.clone();
        field.data_type = incoming.data_type.clone();
        field.options = incoming.options.clone();
        field.required = incoming.required;
        field.is_active = incoming.is_active;
        field.display_order = incoming.display_order;

        let snapshot = field.clone();
        self.audit
            .record(EntityType::CustomField, id, ChangeType::Updated, &snapshot, actor);
        Ok(())
    }

    /// 软停用规则集
    pub fn deactivate_ruleset(&mut self, id: i64, actor: Option<&str>) -> Result<()> {
        let ruleset = self
            .rulesets
            .get_mut(&id)
            .ok_or(RuleError::RulesetNotFound(id))?;
        ruleset.is_active = false;
        ruleset.updated_at = Utc::now();

        let snapshot = ruleset.clone();
        self.audit
            .record(EntityType::Ruleset, id, ChangeType::Deleted, &snapshot, actor);
        Ok(())
    }

    /// 展开规则集中的占位规则，并为新规则分配 id
    pub fn hydrate_ruleset(&mut self, id: i64, actor: Option<&str>) -> Result<HydrationReport> {
        let mut ruleset = self
            .rulesets
            .get(&id)
            .cloned()
            .ok_or(RuleError::RulesetNotFound(id))?;

        let mut report = HydrationReport::default();
        for group in ruleset.rule_groups.iter_mut() {
            let placeholders: BTreeSet<i64> = group
                .rules
                .iter()
                .filter(|r| r.is_active && r.is_placeholder())
                .map(|r| r.id)
                .collect();

            let group_report = hydration::hydrate_group(group)?;
            report.created += group_report.created;
            report.placeholders.extend(group_report.placeholders);

            for rule in group.rules.iter_mut() {
                if rule.id == 0 {
                    rule.id = self.next_id();
                    self.audit
                        .record(EntityType::Rule, rule.id, ChangeType::Created, &*rule, actor);
                } else if placeholders.contains(&rule.id) {
                    self.audit
                        .record(EntityType::Rule, rule.id, ChangeType::Updated, &*rule, actor);
                }
            }
        }

        self.rulesets.insert(id, ruleset);
        Ok(report)
    }

    fn group_mut(&mut self, ruleset_id: i64, group_id: i64) -> Result<&mut RuleGroup> {
        self.rulesets
            .get_mut(&ruleset_id)
            .ok_or(RuleError::RulesetNotFound(ruleset_id))?
            .rule_groups
            .iter_mut()
            .find(|g| g.id == group_id)
            .ok_or_else(|| RuleError::validation(format!("规则组 {} 不在规则集 {} 中", group_id, ruleset_id)))
    }
}

/// 目录存储
#[derive(Clone, Default)]
pub struct CatalogStore {
    catalog: Arc<RwLock<Catalog>>,
    /// 写入前的结构校验
    compiler: Arc<Mutex<RulesetCompiler>>,
}

impl CatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_compiler(compiler: RulesetCompiler) -> Self {
        Self {
            catalog: Arc::new(RwLock::new(Catalog::new())),
            compiler: Arc::new(Mutex::new(compiler)),
        }
    }

    /// 规则集数量
    pub fn len(&self) -> usize {
        self.catalog.read().rulesets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalog.read().rulesets.is_empty()
    }

    /// 校验并创建规则集
    #[instrument(skip(self, ruleset), fields(ruleset = %ruleset.name))]
    pub fn create_ruleset(&self, ruleset: Ruleset, actor: Option<&str>) -> Result<i64> {
        let compiled = self.compiler.lock().compile(ruleset)?;
        self.insert_compiled(compiled, actor)
    }

    /// 从 JSON 创建规则集
    #[instrument(skip(self, json))]
    pub fn load_from_json(&self, json: &str, actor: Option<&str>) -> Result<i64> {
        let compiled = self.compiler.lock().compile_from_json(json)?;
        self.insert_compiled(compiled, actor)
    }

    fn insert_compiled(&self, compiled: CompiledRuleset, actor: Option<&str>) -> Result<i64> {
        let required_fields = compiled.required_fields.len();
        let compile_version = compiled.compile_version;
        let id = self
            .catalog
            .write()
            .insert_ruleset(compiled.ruleset, actor)
            .inspect_err(|e| warn!(error = %e, "规则集创建被拒绝"))?;
        info!(ruleset_id = id, required_fields, compile_version, "规则集已创建");
        Ok(id)
    }

    /// 更新规则集的自身字段
    #[instrument(skip(self, ruleset), fields(ruleset_id = ruleset.id))]
    pub fn update_ruleset(&self, ruleset: &Ruleset, actor: Option<&str>) -> Result<()> {
        self.validate(ruleset)?;

        let result = self
            .catalog
            .write()
            .replace_ruleset_fields(ruleset.id, ruleset, actor);
        if result.is_err() {
            warn!(ruleset_id = ruleset.id, "更新不存在的规则集");
        }
        result
    }

    #[instrument(skip(self, group), fields(group = %group.name))]
    pub fn add_group(&self, ruleset_id: i64, group: RuleGroup, actor: Option<&str>) -> Result<i64> {
        for rule in &group.rules {
            self.compiler
                .lock()
                .validate_rule(rule, &format!("{}.{}", group.name, rule.name))?;
        }
        self.catalog.write().insert_group(ruleset_id, group, actor)
    }

    #[instrument(skip(self, rule), fields(rule = %rule.name))]
    pub fn add_rule(&self, ruleset_id: i64, group_id: i64, rule: Rule, actor: Option<&str>) -> Result<i64> {
        self.compiler.lock().validate_rule(&rule, &rule.name)?;
        self.catalog
            .write()
            .insert_rule(ruleset_id, group_id, rule, actor)
    }

    /// 软停用规则集，审计历史保持完整
    #[instrument(skip(self))]
    pub fn deactivate_ruleset(&self, id: i64, actor: Option<&str>) -> Result<()> {
        self.catalog.write().deactivate_ruleset(id, actor)?;
        info!(ruleset_id = id, "规则集已停用");
        Ok(())
    }

    #[instrument(skip(self, field), fields(entity = %field.entity, key = %field.key))]
    pub fn add_custom_field(&self, field: CustomFieldDefinition, actor: Option<&str>) -> Result<i64> {
        let mut catalog = self.catalog.write();
        if catalog.custom_field(&field.entity, &field.key).is_some() {
            return Err(RuleError::validation(format!(
                "自定义字段 {}.{} 已存在",
                field.entity, field.key
            )));
        }
        Ok(catalog.insert_custom_field(field, actor))
    }

    /// 展开规则集中的占位规则
    #[instrument(skip(self))]
    pub fn hydrate(&self, ruleset_id: i64, actor: Option<&str>) -> Result<HydrationReport> {
        let report = self.transaction(|catalog| catalog.hydrate_ruleset(ruleset_id, actor))?;
        info!(
            ruleset_id,
            created = report.created,
            placeholders = report.placeholders.len(),
            "占位规则已展开"
        );
        Ok(report)
    }

    pub fn get(&self, id: i64) -> Option<Ruleset> {
        self.catalog.read().ruleset(id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Ruleset> {
        self.catalog.read().ruleset_by_name(name).cloned()
    }

    pub fn list_all(&self) -> Vec<Ruleset> {
        self.catalog.read().rulesets().cloned().collect()
    }

    pub fn list_active(&self) -> Vec<Ruleset> {
        self.catalog
            .read()
            .rulesets()
            .filter(|r| r.is_active)
            .cloned()
            .collect()
    }

    pub fn custom_fields(&self) -> Vec<CustomFieldDefinition> {
        self.catalog.read().custom_fields().cloned().collect()
    }

    /// 规则集评估所需的全部字段
    pub fn required_fields(&self, id: i64) -> Result<BTreeSet<String>> {
        let ruleset = self.get(id).ok_or(RuleError::RulesetNotFound(id))?;
        Ok(self.compiler.lock().extract_fields(&ruleset))
    }

    pub fn history(&self, entity_type: EntityType, entity_id: i64) -> Vec<RuleVersion> {
        self.catalog
            .read()
            .audit()
            .history(entity_type, entity_id)
            .into_iter()
            .cloned()
            .collect()
    }

    /// 在读锁下访问目录
    pub fn read<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&Catalog) -> T,
    {
        f(&self.catalog.read())
    }

    /// 在目录副本上执行一组变更，成功后整体替换
    ///
    /// 暂存期间读者仍看到旧目录；其他写者排队等待。
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Catalog) -> Result<T>,
    {
        let guard = self.catalog.upgradable_read();
        let mut staged = Catalog::clone(&guard);

        let value = f(&mut staged)?;

        let mut writer = RwLockUpgradableReadGuard::upgrade(guard);
        *writer = staged;
        Ok(value)
    }

    /// 目录统计
    pub fn stats(&self) -> CatalogStats {
        let catalog = self.catalog.read();
        let rulesets = catalog.rulesets.len();
        let groups = catalog.rulesets().map(|r| r.rule_groups.len()).sum();
        let rules = catalog.rulesets().map(Ruleset::rule_count).sum();

        CatalogStats {
            rulesets,
            groups,
            rules,
            custom_fields: catalog.custom_fields.len(),
            audit_records: catalog.audit.len(),
        }
    }

    fn validate(&self, ruleset: &Ruleset) -> Result<()> {
        self.compiler.lock().validate_ruleset(ruleset)
    }
}

#[async_trait]
impl RulesetRepository for CatalogStore {
    async fn get_ruleset(&self, id: i64) -> Result<Option<Ruleset>> {
        Ok(self.get(id))
    }

    async fn list_active_rulesets(&self) -> Result<Vec<Ruleset>> {
        Ok(self.list_active())
    }
}

/// 目录统计信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogStats {
    pub rulesets: usize,
    pub groups: usize,
    pub rules: usize,
    pub custom_fields: usize,
    pub audit_records: usize,
}

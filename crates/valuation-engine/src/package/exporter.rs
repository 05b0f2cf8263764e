//! 规则包导出

use super::models::{Package, PackageBuilder, PackageMetadata};
use crate::error::{Result, RuleError};
use crate::store::Catalog;

/// 从目录导出规则包
#[derive(Debug, Clone, Copy, Default)]
pub struct PackageExporter {
    active_only: bool,
}

impl PackageExporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 只导出启用的规则组与规则
    pub fn active_only(mut self) -> Self {
        self.active_only = true;
        self
    }

    /// 导出规则集及其引用的自定义字段定义
    pub fn export(&self, catalog: &Catalog, ruleset_id: i64, metadata: PackageMetadata) -> Result<Package> {
        let ruleset = catalog
            .ruleset(ruleset_id)
            .ok_or(RuleError::RulesetNotFound(ruleset_id))?;

        let mut package = PackageBuilder::with_metadata(metadata)
            .active_only(self.active_only)
            .ruleset(ruleset)
            .build();

        let referenced = package.referenced_custom_fields();
        for field in catalog.custom_fields().filter(|f| referenced.contains(&f.key)) {
            let mut field = field.clone();
            field.id = 0;
            package.custom_field_definitions.push(field);
        }

        Ok(package)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::conditions::{ConditionLeaf, ConditionTree};
    use crate::models::{CustomFieldDefinition, Rule, RuleGroup, Ruleset};
    use crate::operators::Operator;

    fn catalog() -> (Catalog, i64) {
        let mut catalog = Catalog::new();
        let mut retired = Rule::new("Retired").with_action(Action::formula("custom.legacy_score * 2"));
        retired.is_active = false;

        let id = catalog.insert_ruleset(
            Ruleset::new("Laptops", 12).with_group(
                RuleGroup::new("Extras", "misc")
                    .with_rule(
                        Rule::new("Dock")
                            .with_conditions(ConditionTree::leaf(ConditionLeaf::new(
                                "custom.has_dock",
                                Operator::Equals,
                                true,
                            )))
                            .with_action(Action::fixed(25.0)),
                    )
                    .with_rule(retired),
            ),
            None,
        )
        .unwrap();
        catalog.insert_custom_field(CustomFieldDefinition::new("listing", "has_dock", "boolean"), None);
        catalog.insert_custom_field(CustomFieldDefinition::new("listing", "legacy_score", "number"), None);
        catalog.insert_custom_field(CustomFieldDefinition::new("listing", "unrelated", "string"), None);
        (catalog, id)
    }

    #[test]
    fn test_export_collects_referenced_fields() {
        let (catalog, id) = catalog();
        let package = PackageExporter::new()
            .export(&catalog, id, PackageMetadata::new("laptops", "1.0.0"))
            .unwrap();

        assert_eq!(package.rules.len(), 2);
        let keys: Vec<_> = package.custom_field_definitions.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, ["has_dock", "legacy_score"]);
        assert!(package.custom_field_definitions.iter().all(|f| f.id == 0));
    }

    #[test]
    fn test_active_only_export() {
        let (catalog, id) = catalog();
        let package = PackageExporter::new()
            .active_only()
            .export(&catalog, id, PackageMetadata::new("laptops", "1.0.0"))
            .unwrap();

        assert_eq!(package.rules.len(), 1);
        let keys: Vec<_> = package.custom_field_definitions.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, ["has_dock"]);
    }

    #[test]
    fn test_export_missing_ruleset() {
        let err = PackageExporter::new()
            .export(&Catalog::new(), 7, PackageMetadata::new("x", "1.0.0"))
            .unwrap_err();
        assert_eq!(err.code(), "RULESET_NOT_FOUND");
    }
}

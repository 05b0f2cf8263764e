//! 规则包
//!
//! 把规则集及其依赖导出为可移植的 JSON 文档，并在另一套目录中按合并策略安装。

pub mod compatibility;
pub mod exporter;
pub mod installer;
pub mod models;

pub use compatibility::{AppVersion, CompatibilityReport, validate_compatibility};
pub use exporter::PackageExporter;
pub use installer::{InstallAction, InstallOutcome, InstallReport, MergeStrategy, PackageInstaller};
pub use models::{
    Package, PackageBuilder, PackageExample, PackageMetadata, RuleExport, RuleGroupExport, RulesetExport,
    SCHEMA_VERSION,
};

use crate::error::Result;
use crate::store::CatalogStore;
use std::collections::BTreeSet;
use tracing::{info, instrument};

/// 规则包服务
#[derive(Clone)]
pub struct PackageService {
    store: CatalogStore,
    app_version: String,
}

impl PackageService {
    pub fn new(store: CatalogStore, app_version: impl Into<String>) -> Self {
        Self {
            store,
            app_version: app_version.into(),
        }
    }

    pub fn store(&self) -> &CatalogStore {
        &self.store
    }

    /// 导出规则集
    #[instrument(skip(self, metadata), fields(package = %metadata.name))]
    pub fn export_package(&self, ruleset_id: i64, metadata: PackageMetadata) -> Result<Package> {
        self.export_with(PackageExporter::new(), ruleset_id, metadata)
    }

    /// 只导出启用的规则组与规则
    #[instrument(skip(self, metadata), fields(package = %metadata.name))]
    pub fn export_active_package(&self, ruleset_id: i64, metadata: PackageMetadata) -> Result<Package> {
        self.export_with(PackageExporter::new().active_only(), ruleset_id, metadata)
    }

    fn export_with(&self, exporter: PackageExporter, ruleset_id: i64, metadata: PackageMetadata) -> Result<Package> {
        let package = self
            .store
            .read(|catalog| exporter.export(catalog, ruleset_id, metadata))?;
        info!(
            ruleset_id,
            groups = package.rule_groups.len(),
            rules = package.rules.len(),
            custom_fields = package.custom_field_definitions.len(),
            "规则包已导出"
        );
        Ok(package)
    }

    /// 检查包与当前应用的兼容性
    pub fn validate_compatibility(&self, package: &Package, available_fields: &BTreeSet<String>) -> CompatibilityReport {
        validate_compatibility(package, &self.app_version, available_fields)
    }

    /// 安装规则包
    pub fn install_package(&self, package: &Package, strategy: MergeStrategy) -> Result<InstallReport> {
        PackageInstaller::new(self.app_version.clone()).install(&self.store, package, strategy)
    }

    /// 以指定操作人身份安装，操作人写入审计记录
    pub fn install_package_as(&self, package: &Package, strategy: MergeStrategy, actor: &str) -> Result<InstallReport> {
        PackageInstaller::new(self.app_version.clone())
            .with_actor(actor)
            .install(&self.store, package, strategy)
    }
}

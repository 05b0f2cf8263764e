//! 安装前的兼容性检查
//!
//! 检查结果是结构化报告，不会阻止调用方查看包内容。

use super::models::{CUSTOM_FIELD_PREFIX, Package};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// `major.minor.patch` 版本号
///
/// 缺失的分量按 0 处理，`v` 前缀与 `-` 之后的预发布标记被忽略。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AppVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl AppVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch }
    }
}

impl FromStr for AppVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches(['v', 'V']);
        let core = trimmed.split(['-', '+']).next().unwrap_or_default();
        if core.is_empty() {
            return Err(format!("无效的版本号: '{}'", s));
        }

        let mut parts = [0u64; 3];
        for (i, part) in core.split('.').enumerate() {
            if i >= parts.len() {
                return Err(format!("无效的版本号: '{}'", s));
            }
            parts[i] = part
                .parse()
                .map_err(|_| format!("无效的版本号: '{}'", s))?;
        }

        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

impl fmt::Display for AppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// 兼容性报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityReport {
    /// 应用版本满足包的最低版本要求
    pub compatible: bool,
    pub app_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_app_version: Option<String>,
    pub warnings: Vec<String>,
    /// 包引用但当前环境缺少的自定义字段，形如 `custom.<key>`
    pub missing_fields: Vec<String>,
}

impl CompatibilityReport {
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// 检查包与当前应用的兼容性
///
/// `available_fields` 中的字段既可以写作 `custom.<key>` 也可以只写 `<key>`。
pub fn validate_compatibility(
    package: &Package,
    app_version: &str,
    available_fields: &BTreeSet<String>,
) -> CompatibilityReport {
    let mut warnings = Vec::new();
    let min_app_version = package.metadata.min_app_version.clone();

    let compatible = match &min_app_version {
        None => true,
        Some(required) => match (required.parse::<AppVersion>(), app_version.parse::<AppVersion>()) {
            (Ok(required_version), Ok(current)) => match current.cmp(&required_version) {
                Ordering::Less => {
                    warnings.push(format!(
                        "包要求应用版本 >= {}，当前为 {}",
                        required_version, current
                    ));
                    false
                }
                _ => true,
            },
            (Err(e), _) | (_, Err(e)) => {
                warnings.push(e);
                false
            }
        },
    };

    let mut missing_fields = Vec::new();
    for key in package.referenced_custom_fields() {
        let reference = format!("{}{}", CUSTOM_FIELD_PREFIX, key);
        if available_fields.contains(&reference) || available_fields.contains(&key) {
            continue;
        }
        let bundled = package
            .custom_field_definitions
            .iter()
            .any(|f| f.key == key);
        warnings.push(if bundled {
            format!("自定义字段 '{}' 尚未定义，安装时会随包创建", reference)
        } else {
            format!("自定义字段 '{}' 未定义，相关条件将不会命中", reference)
        });
        missing_fields.push(reference);
    }

    CompatibilityReport {
        compatible,
        app_version: app_version.to_string(),
        min_app_version,
        warnings,
        missing_fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::models::{CustomFieldDefinition, Rule, RuleGroup, Ruleset};
    use crate::package::models::PackageBuilder;

    fn fields(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_versions() {
        assert_eq!("1.5.0".parse::<AppVersion>().unwrap(), AppVersion::new(1, 5, 0));
        assert_eq!("v2".parse::<AppVersion>().unwrap(), AppVersion::new(2, 0, 0));
        assert_eq!("2.1.3-beta.1".parse::<AppVersion>().unwrap(), AppVersion::new(2, 1, 3));
        assert!("1.x".parse::<AppVersion>().is_err());
        assert!("1.2.3.4".parse::<AppVersion>().is_err());
        assert!("".parse::<AppVersion>().is_err());
    }

    #[test]
    fn test_component_wise_ordering() {
        let a: AppVersion = "1.10.0".parse().unwrap();
        let b: AppVersion = "1.9.9".parse().unwrap();
        assert!(a > b);
    }

    #[test]
    fn test_min_app_version_too_new() {
        let package = PackageBuilder::new("p", "1.0.0").min_app_version("2.0.0").build();
        let report = validate_compatibility(&package, "1.5.0", &BTreeSet::new());

        assert!(!report.compatible);
        assert!(report.has_warnings());
        assert_eq!(report.min_app_version.as_deref(), Some("2.0.0"));
    }

    #[test]
    fn test_compatible_without_requirement() {
        let package = PackageBuilder::new("p", "1.0.0").build();
        let report = validate_compatibility(&package, "0.1.0", &BTreeSet::new());
        assert!(report.compatible);
        assert!(report.warnings.is_empty());

        let newer = PackageBuilder::new("p", "1.0.0").min_app_version("1.5.0").build();
        assert!(validate_compatibility(&newer, "1.5.0", &BTreeSet::new()).compatible);
    }

    #[test]
    fn test_invalid_version_is_reported() {
        let package = PackageBuilder::new("p", "1.0.0").min_app_version("latest").build();
        let report = validate_compatibility(&package, "1.0.0", &BTreeSet::new());
        assert!(!report.compatible);
        assert!(report.warnings[0].contains("latest"));
    }

    #[test]
    fn test_missing_custom_fields() {
        let ruleset = Ruleset::new("R", 1).with_group(
            RuleGroup::new("g", "misc")
                .with_rule(Rule::new("a").with_action(Action::per_unit(2.0, "custom.warranty_months")))
                .with_rule(Rule::new("b").with_action(Action::formula("custom.support_tier * 3 + custom.dock"))),
        );
        let package = PackageBuilder::new("p", "1.0.0")
            .ruleset(&ruleset)
            .custom_field(&CustomFieldDefinition::new("listing", "dock", "boolean"))
            .build();

        let report = validate_compatibility(&package, "1.0.0", &fields(&["custom.warranty_months"]));
        assert!(report.compatible);
        assert_eq!(report.missing_fields, ["custom.dock", "custom.support_tier"]);
        assert!(report.warnings[0].contains("随包创建"));

        let report = validate_compatibility(&package, "1.0.0", &fields(&["warranty_months", "support_tier", "dock"]));
        assert!(report.missing_fields.is_empty());
    }
}

//! 估值规则引擎
//!
//! 按优先级评估带条件的定价规则，为商品计算价格调整，包括：
//! - 受限表达式语言的解析、校验与沙箱求值
//! - 嵌套 AND/OR 条件树评估
//! - 多种动作类型与乘法修正系数叠加
//! - 基线/基础/高级三层规则集评估
//! - 规则包导出、兼容性检查与合并安装

pub mod action;
pub mod audit;
pub mod compiler;
pub mod conditions;
pub mod context;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod expression;
pub mod hydration;
pub mod layered;
pub mod models;
pub mod operators;
pub mod package;
pub mod results;
pub mod rule_evaluator;
pub mod service;
pub mod store;

pub use action::{Action, ActionBreakdown, ActionCalculator, ActionKind, Modifiers};
pub use audit::{AuditLog, ChangeType, EntityType, RuleVersion};
pub use compiler::{CompiledRuleset, RulesetCompiler};
pub use conditions::{ConditionLeaf, ConditionSpec, ConditionTree, FieldType};
pub use context::{EvaluationContext, FieldSource};
pub use error::{EvaluationErrorKind, Result, RuleError};
pub use evaluator::ConditionEvaluator;
pub use executor::{ConditionExecutor, ConditionTrace};
pub use expression::{Diagnostic, FormulaEngine, FormulaLimits, FormulaValidation, Severity};
pub use layered::{LayerConfig, LayeredEvaluator};
pub use models::{CustomFieldDefinition, Rule, RuleGroup, Ruleset};
pub use operators::{LogicalOperator, Operator};
pub use package::{CompatibilityReport, InstallReport, MergeStrategy, Package, PackageMetadata, PackageService};
pub use results::{EvaluationResult, EvaluationStats, Layer, MatchedRule, RulesetEvaluation};
pub use rule_evaluator::RuleEvaluator;
pub use service::{InMemoryItemRepository, ItemRecord, ItemRepository, RulesetRepository, ValuationService};
pub use store::{Catalog, CatalogStore};

//! 公式引擎
//!
//! 按公式文本缓存解析与校验结果，同一公式在多个商品间重复求值时不再重新解析。

use super::ast::Expr;
use super::interpreter::evaluate_number;
use super::parser::parse;
use super::validator::{Diagnostic, ExpressionValidator, FormulaLimits, Severity};
use crate::context::FieldSource;
use crate::error::Result;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// 解析并通过校验的公式
#[derive(Debug, Clone)]
pub struct CompiledFormula {
    pub text: String,
    pub expr: Expr,
    /// 公式引用的全部字段
    pub fields: BTreeSet<String>,
    /// 编译时产生的警告与提示
    pub diagnostics: Vec<Diagnostic>,
}

/// 公式校验报告
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FormulaValidation {
    pub valid: bool,
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
    pub info: Vec<Diagnostic>,
    /// 提供样例上下文且求值成功时的预览结果
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<f64>,
    pub used_fields: Vec<String>,
}

impl FormulaValidation {
    fn push(&mut self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Error => self.errors.push(diagnostic),
            Severity::Warning => self.warnings.push(diagnostic),
            Severity::Info => self.info.push(diagnostic),
        }
    }
}

/// 缓存默认容量
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// 公式引擎
#[derive(Debug)]
pub struct FormulaEngine {
    validator: ExpressionValidator,
    /// 编译后的公式缓存
    cache: DashMap<String, Arc<CompiledFormula>>,
    cache_capacity: usize,
}

impl Default for FormulaEngine {
    fn default() -> Self {
        Self::with_limits(FormulaLimits::default())
    }
}

impl FormulaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: FormulaLimits) -> Self {
        Self {
            validator: ExpressionValidator::new(limits),
            cache: DashMap::new(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }

    /// 容量为 0 时不缓存
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn limits(&self) -> FormulaLimits {
        self.validator.limits()
    }

    /// 解析公式，不做语义校验
    pub fn parse(&self, text: &str) -> Result<Expr> {
        parse(text)
    }

    /// 解析并校验公式，结果按文本缓存
    ///
    /// 任一错误级诊断都会使编译失败。
    pub fn compile(&self, text: &str) -> Result<Arc<CompiledFormula>> {
        if let Some(compiled) = self.cache.get(text) {
            return Ok(Arc::clone(compiled.value()));
        }

        let expr = parse(text)?;
        let diagnostics = self.validator.validate(&expr, None);
        if let Some(error) = diagnostics.iter().find(|d| d.is_error()) {
            return Err(error.clone().into_error());
        }

        let compiled = Arc::new(CompiledFormula {
            text: text.to_string(),
            fields: expr.referenced_fields(),
            expr,
            diagnostics,
        });
        if self.cache_capacity > 0 {
            // 满了整体清空
            if self.cache.len() >= self.cache_capacity {
                debug!(capacity = self.cache_capacity, "公式缓存已满，清空重建");
                self.cache.clear();
            }
            self.cache.insert(text.to_string(), Arc::clone(&compiled));
        }
        debug!(formula = %text, "公式已编译");

        Ok(compiled)
    }

    /// 对上下文求值
    pub fn evaluate<S>(&self, text: &str, source: &S) -> Result<f64>
    where
        S: FieldSource + ?Sized,
    {
        let compiled = self.compile(text)?;
        evaluate_number(&compiled.expr, source)
    }

    /// 校验公式并生成报告，不会返回错误
    pub fn validate_formula(
        &self,
        text: &str,
        available_fields: Option<&BTreeSet<String>>,
        sample: Option<&dyn FieldSource>,
    ) -> FormulaValidation {
        let mut report = FormulaValidation::default();

        let expr = match parse(text) {
            Ok(expr) => expr,
            Err(e) => {
                report.push(Diagnostic::from_error(&e));
                return report;
            }
        };

        report.used_fields = expr.referenced_fields().into_iter().collect();
        for diagnostic in self.validator.validate(&expr, available_fields) {
            report.push(diagnostic);
        }
        report.valid = report.errors.is_empty();

        if report.valid {
            if let Some(sample) = sample {
                match evaluate_number(&expr, sample) {
                    Ok(value) => report.preview = Some(value),
                    Err(e) => report.push(Diagnostic {
                        severity: Severity::Warning,
                        ..Diagnostic::from_error(&e)
                    }),
                }
            }
        }

        report
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

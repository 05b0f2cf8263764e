//! 估值引擎性能基准测试
//!
//! 覆盖单个操作符比较、公式求值（含缓存命中）以及多层规则集评估。

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::hint::black_box;
use valuation_engine::conditions::{ConditionLeaf, ConditionSpec, ConditionTree};
use valuation_engine::{
    Action, ConditionEvaluator, EvaluationContext, FormulaEngine, LayerConfig, LayeredEvaluator, Modifiers, Operator,
    Rule, RuleGroup, Ruleset,
};

fn listing() -> EvaluationContext {
    EvaluationContext::new(json!({
        "ram_gb": 32,
        "ram_type": "ddr4",
        "storage_type": "1TB NVMe SSD",
        "condition": "used",
        "manufacturer": "Dell",
        "age_years": 3,
        "cpu": {"cpu_mark_multi": 24000, "cores": 8},
        "gpu": {"model": "RTX 3060"},
    }))
}

/// 操作符比较基准
fn bench_operators(c: &mut Criterion) {
    let mut group = c.benchmark_group("operators");

    let cases: Vec<(&str, Value, Operator, Value)> = vec![
        ("gte", json!(32), Operator::Gte, json!(16)),
        ("equals_string", json!("used"), Operator::Equals, json!("used")),
        ("contains", json!("1TB NVMe SSD"), Operator::Contains, json!("NVMe")),
        ("in", json!("ddr4"), Operator::In, json!(["ddr3", "ddr4", "ddr5"])),
        ("between", json!(24000), Operator::Between, json!([10000, 30000])),
        ("regex", json!("RTX 3060"), Operator::Regex, json!("^RTX\\s+30\\d0$")),
    ];

    for (name, field, operator, expected) in &cases {
        group.bench_function(*name, |b| {
            b.iter(|| ConditionEvaluator::evaluate(black_box(Some(field)), *operator, black_box(expected)))
        });
    }

    group.bench_function("missing_field", |b| {
        b.iter(|| ConditionEvaluator::evaluate(black_box(None), Operator::Gte, black_box(&json!(16))))
    });

    group.finish();
}

/// 公式基准
fn bench_formulas(c: &mut Criterion) {
    let mut group = c.benchmark_group("formulas");
    let ctx = listing();
    let formula = "max(ram_gb * 2.5 if ram_gb >= 16 else ram_gb * 3.0, cpu.cpu_mark_multi / 1000) + round(age_years * 1.5)";

    let cached = FormulaEngine::new();
    cached.evaluate(formula, &ctx).ok();
    group.bench_function("evaluate_cached", |b| {
        b.iter(|| cached.evaluate(black_box(formula), &ctx))
    });

    group.bench_function("evaluate_cold", |b| {
        b.iter(|| {
            let engine = FormulaEngine::new();
            engine.evaluate(black_box(formula), &ctx)
        })
    });

    let available: BTreeSet<String> = ["ram_gb", "age_years", "cpu.cpu_mark_multi"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    group.bench_function("validate", |b| {
        b.iter(|| cached.validate_formula(black_box(formula), Some(&available), Some(&ctx)))
    });

    group.finish();
}

fn ruleset(index: usize, rules: usize) -> Ruleset {
    let mut group = RuleGroup::new(format!("Group {}", index), "misc");
    for r in 0..rules {
        let conditions = ConditionTree::all(vec![
            ConditionSpec::leaf("ram_gb", Operator::Gte, (r % 64) as i64),
            ConditionSpec::or(vec![
                ConditionSpec::leaf("storage_type", Operator::Contains, "NVMe"),
                ConditionSpec::leaf("manufacturer", Operator::Equals, "Lenovo"),
            ]),
        ]);
        let action = match r % 3 {
            0 => Action::fixed(10.0),
            1 => Action::per_unit(1.5, "ram_gb"),
            _ => Action::formula("cpu.cpu_mark_multi / 1000 * 2"),
        }
        .with_modifiers(
            Modifiers::default()
                .with_condition_multiplier("used", 0.8)
                .with_age_curve(0.1, 0.5),
        );
        group = group.with_rule(
            Rule::new(format!("Rule {}", r))
                .with_id((index * 1000 + r) as i64)
                .with_conditions(conditions)
                .with_action(action),
        );
    }

    Ruleset::new(format!("Ruleset {}", index), (index * 4) as i32)
        .with_id(index as i64 + 1)
        .with_conditions(ConditionTree::leaf(ConditionLeaf::new("ram_gb", Operator::Gt, 0)))
        .with_group(group)
}

/// 多层评估规模基准
fn bench_layered(c: &mut Criterion) {
    let mut group = c.benchmark_group("layered_evaluation");
    let ctx = listing();
    let evaluator = LayeredEvaluator::new(LayerConfig::default());

    for rules in [10usize, 50, 200] {
        let rulesets: Vec<Ruleset> = (0..4).map(|i| ruleset(i, rules)).collect();
        group.bench_with_input(BenchmarkId::from_parameter(rules), &rulesets, |b, rulesets| {
            b.iter(|| evaluator.evaluate(black_box(rulesets), &[], 1000.0, &ctx))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_operators, bench_formulas, bench_layered);

criterion_main!(benches);

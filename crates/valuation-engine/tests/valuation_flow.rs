//! 估值流程集成测试
//!
//! 从目录存储加载规则集，经估值服务完成多层评估与写回。

use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use valuation_engine::action::Modifiers;
use valuation_engine::conditions::{ConditionLeaf, ConditionSpec, ConditionTree};
use valuation_engine::models::SYSTEM_BASELINE_KEY;
use valuation_engine::{
    Action, CatalogStore, ConditionExecutor, EvaluationContext, FormulaEngine, InMemoryItemRepository, ItemRecord,
    Layer, LayeredEvaluator, Operator, Rule, RuleEvaluator, RuleGroup, Ruleset, ValuationService,
};
use valuation_shared::config::EngineConfig;

fn always(name: &str, value: f64) -> Rule {
    Rule::new(name).with_action(Action::fixed(value))
}

fn seeded_store() -> CatalogStore {
    valuation_shared::observability::init_for_tests();

    let store = CatalogStore::new();
    store
        .create_ruleset(
            Ruleset::new("System Baseline", 50)
                .with_metadata(SYSTEM_BASELINE_KEY, true)
                .with_group(RuleGroup::new("Base", "misc").with_rule(always("Baseline bump", 50.0))),
            Some("system"),
        )
        .unwrap();
    store
        .create_ruleset(
            Ruleset::new("Workstation Basics", 8).with_group(
                RuleGroup::new("Memory", "ram").with_rule(
                    Rule::new("16GB+")
                        .with_conditions(ConditionTree::leaf(ConditionLeaf::new("ram_gb", Operator::Gte, 16)))
                        .with_action(Action::fixed(25.0)),
                ),
            ),
            Some("alice"),
        )
        .unwrap();
    store
}

fn service(store: CatalogStore, items: Arc<InMemoryItemRepository>) -> ValuationService<CatalogStore, InMemoryItemRepository> {
    let evaluator = LayeredEvaluator::from_config(&EngineConfig::default());
    ValuationService::new(Arc::new(store), items, evaluator)
}

#[tokio::test]
async fn test_baseline_plus_basic_layers() {
    let items = Arc::new(InMemoryItemRepository::new());
    items.insert(ItemRecord::new(1, 1000.0, json!({"ram_gb": 16})));
    let service = service(seeded_store(), Arc::clone(&items));

    let result = service.apply(1).await.unwrap();

    assert_eq!(result.total_adjustment, 75.0);
    assert_eq!(result.adjusted_price, 1075.0);
    assert_eq!(result.matched_rules.len(), 2);
    assert_eq!(result.matched_rules[0].layer, Layer::Baseline);
    assert_eq!(result.matched_rules[1].layer, Layer::Basic);
    assert_eq!(result.matched_rules[1].ruleset_name, "Workstation Basics");

    let stored = items.get(1).unwrap();
    assert_eq!(stored.adjusted_price, Some(1075.0));
    let breakdown = stored.valuation_breakdown.unwrap();
    assert_eq!(breakdown["layers"][0]["layer"], "baseline");
    assert_eq!(breakdown["layers"][1]["rulesets"][0]["adjustment"], 25.0);
}

#[tokio::test]
async fn test_matched_rules_carry_condition_trace() {
    let items = Arc::new(InMemoryItemRepository::new());
    items.insert(ItemRecord::new(1, 1000.0, json!({"ram_gb": 32})));
    let service = service(seeded_store(), Arc::clone(&items));

    let result = service.apply(1).await.unwrap();

    let basics = &result.matched_rules[1];
    assert_eq!(basics.rule.trace.len(), 1);
    assert_eq!(basics.rule.trace[0].text, "ram_gb >= 16");
    assert!(basics.rule.trace[0].matched);
    assert_eq!(basics.rule.trace[0].actual, Some(json!(32)));

    let breakdown = items.get(1).unwrap().valuation_breakdown.unwrap();
    assert_eq!(breakdown["matched_rules"][1]["trace"][0]["text"], "ram_gb >= 16");
}

#[tokio::test]
async fn test_trace_can_be_switched_off() {
    let items = Arc::new(InMemoryItemRepository::new());
    items.insert(ItemRecord::new(1, 1000.0, json!({"ram_gb": 32})));
    let config = EngineConfig {
        trace: false,
        ..EngineConfig::default()
    };
    let service = ValuationService::new(
        Arc::new(seeded_store()),
        Arc::clone(&items),
        LayeredEvaluator::from_config(&config),
    );

    let result = service.apply(1).await.unwrap();
    assert!(result.matched_rules.iter().all(|m| m.rule.trace.is_empty()));
}

#[tokio::test]
async fn test_exclusions_and_single_mode_agree() {
    let store = seeded_store();
    let basics = store.find_by_name("Workstation Basics").unwrap().id;
    let items = Arc::new(InMemoryItemRepository::new());
    items.insert(ItemRecord::new(1, 1000.0, json!({"ram_gb": 32})));
    let service = service(store, items);

    let full = service.evaluate_item(1, &[], None).await.unwrap();
    let excluded = service.evaluate_item(1, &[basics], None).await.unwrap();
    let single = service.evaluate_item(1, &[], Some(basics)).await.unwrap();

    assert_eq!(excluded.total_adjustment, 50.0);
    assert_eq!(single.total_adjustment, 25.0);
    let contribution = full.layer(Layer::Basic).unwrap().rulesets[0].adjustment;
    assert_eq!(single.total_adjustment, contribution);
}

#[tokio::test]
async fn test_activation_condition_gates_ruleset() {
    let store = seeded_store();
    store
        .create_ruleset(
            Ruleset::new("Gaming Premium", 20)
                .with_conditions(ConditionTree::leaf(ConditionLeaf::new("form_factor", Operator::Equals, "tower")))
                .with_group(RuleGroup::new("GPU", "gpu").with_rule(always("GPU bump", 100.0))),
            None,
        )
        .unwrap();

    let items = Arc::new(InMemoryItemRepository::new());
    items.insert(ItemRecord::new(1, 500.0, json!({"ram_gb": 8, "form_factor": "mini"})));
    items.insert(ItemRecord::new(2, 500.0, json!({"ram_gb": 8, "form_factor": "tower"})));
    let service = service(store, items);

    assert_eq!(service.evaluate_item(1, &[], None).await.unwrap().total_adjustment, 50.0);
    let tower = service.evaluate_item(2, &[], None).await.unwrap();
    assert_eq!(tower.total_adjustment, 150.0);
    assert_eq!(tower.layer(Layer::Advanced).unwrap().adjustment, 100.0);
}

#[tokio::test]
async fn test_broken_ruleset_is_isolated() {
    let store = seeded_store();
    let id = store
        .create_ruleset(
            Ruleset::new("Fragile", 9).with_group(RuleGroup::new("g", "misc").with_rule(always("ok", 1.0))),
            None,
        )
        .unwrap();
    // 绕过校验写入无法解析的公式，模拟历史遗留数据
    store
        .transaction(|catalog| {
            let ruleset = catalog.ruleset(id).unwrap().clone();
            let group = &ruleset.rule_groups[0];
            let mut rule = group.rules[0].clone();
            rule.actions = vec![Action::formula("ram_gb +* 2")];
            catalog.replace_rule_fields(id, group.id, rule.id, &rule, None)
        })
        .unwrap();

    let items = Arc::new(InMemoryItemRepository::new());
    items.insert(ItemRecord::new(1, 1000.0, json!({"ram_gb": 16})));
    let result = service(store, items).evaluate_item(1, &[], None).await.unwrap();

    assert_eq!(result.total_adjustment, 75.0);
    assert_eq!(result.stats.rulesets_failed, 1);
    let failed = result
        .layer(Layer::Basic)
        .unwrap()
        .rulesets
        .iter()
        .find(|r| r.ruleset_id == id)
        .unwrap();
    assert_eq!(failed.adjustment, 0.0);
    assert!(failed.error.is_some());
}

#[test]
fn test_modifier_stacking_scenario() {
    let action = Action::fixed(100.0).with_modifiers(
        Modifiers::default()
            .with_field_multiplier("ram_type", [("ddr3", 0.7)])
            .with_condition_multiplier("used", 0.6),
    );
    let ruleset = Ruleset::new("Condition", 7)
        .with_group(RuleGroup::new("RAM", "ram").with_rule(Rule::new("DDR").with_action(action)));
    let ctx = EvaluationContext::new(json!({"ram_type": "DDR3", "condition": "used"}));

    let result = RuleEvaluator::new().evaluate_ruleset(&ruleset, &ctx).unwrap();
    assert!((result.total_adjustment - 42.0).abs() < 1e-9);
}

#[test]
fn test_and_group_with_missing_requirement() {
    let tree = ConditionTree::all(vec![
        ConditionSpec::leaf("ram_gb", Operator::Gte, 32),
        ConditionSpec::leaf("storage_type", Operator::Contains, "NVMe"),
    ]);
    let ctx = EvaluationContext::new(json!({"ram_gb": 16, "storage_type": "1TB NVMe SSD"}));
    assert!(!ConditionExecutor::new().evaluate(&tree, &ctx));
}

#[test]
fn test_conditional_formula_scenario() {
    let engine = FormulaEngine::new();
    let formula = "ram_gb * 2.5 if ram_gb >= 16 else ram_gb * 3.0";

    let small = EvaluationContext::new(json!({"ram_gb": 8}));
    let large = EvaluationContext::new(json!({"ram_gb": 32}));
    assert_eq!(engine.evaluate(formula, &small).unwrap(), 24.0);
    assert_eq!(engine.evaluate(formula, &large).unwrap(), 80.0);
}

#[test]
fn test_sandbox_rejects_dangerous_formulas() {
    let engine = FormulaEngine::new();
    let ctx = EvaluationContext::new(json!({"ram_gb": 8}));

    for formula in [
        "__import__('os').system('ls')",
        "eval('1 + 1')",
        "exec('x = 1')",
        "lambda x: x",
        "import os",
        "ram_gb.__class__",
        "open('/etc/passwd')",
        "x = 1",
    ] {
        let err = engine.evaluate(formula, &ctx).unwrap_err();
        assert!(err.is_authoring(), "'{}' 应在解析或校验阶段被拒绝", formula);

        let report = engine.validate_formula(formula, None, None);
        assert!(!report.valid, "'{}' 不应通过校验", formula);
    }
}

#[test]
fn test_validate_formula_against_available_fields() {
    let engine = FormulaEngine::new();
    let available: BTreeSet<String> = ["ram_gb", "cpu.cpu_mark_multi"].iter().map(|s| s.to_string()).collect();
    let sample = EvaluationContext::new(json!({"ram_gb": 16, "cpu": {"cpu_mark_multi": 20000}}));

    let ok = engine.validate_formula("ram_gb * 2 + cpu.cpu_mark_multi / 1000", Some(&available), Some(&sample));
    assert!(ok.valid);
    assert_eq!(ok.preview, Some(52.0));

    let typo = engine.validate_formula("ram_g * 2", Some(&available), None);
    assert!(!typo.valid);
    assert_eq!(typo.errors[0].suggestion.as_deref(), Some("是否想引用 'ram_gb'？"));
}

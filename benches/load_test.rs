//! 负载测试
//!
//! 模拟多线程并发估值与目录读写混合场景。

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use serde_json::json;
use std::hint::black_box;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use valuation_engine::conditions::{ConditionLeaf, ConditionSpec, ConditionTree};
use valuation_engine::{
    Action, CatalogStore, EvaluationContext, LayerConfig, LayeredEvaluator, Modifiers, Operator, Rule, RuleGroup,
    Ruleset,
};

/// 并发评估配置
struct ConcurrencyConfig {
    thread_count: usize,
    iterations_per_thread: usize,
    ruleset_count: usize,
}

/// 并发评估结果
#[derive(Debug)]
#[allow(dead_code)]
struct ConcurrencyResult {
    total_evaluations: usize,
    total_duration: Duration,
    throughput_per_sec: f64,
    avg_latency_us: f64,
    p99_latency_us: u64,
}

fn create_ruleset(index: usize) -> Ruleset {
    let group = RuleGroup::new("Hardware", "misc")
        .with_rule(
            Rule::new("RAM")
                .with_conditions(ConditionTree::leaf(ConditionLeaf::new(
                    "ram_gb",
                    Operator::Gte,
                    16,
                )))
                .with_action(Action::per_unit(1.5, "ram_gb")),
        )
        .with_rule(
            Rule::new("CPU")
                .with_conditions(ConditionTree::all(vec![
                    ConditionSpec::leaf("cpu.cpu_mark_multi", Operator::GreaterThan, 10000 + index as i64),
                    ConditionSpec::leaf("condition", Operator::In, json!(["new", "refurb", "used"])),
                ]))
                .with_action(
                    Action::formula("cpu.cpu_mark_multi / 1000 * 2.5")
                        .with_modifiers(Modifiers::default().with_condition_multiplier("used", 0.8)),
                ),
        );

    Ruleset::new(format!("Ruleset {}", index), (index * 3) as i32).with_group(group)
}

fn seeded_store(ruleset_count: usize) -> CatalogStore {
    let store = CatalogStore::new();
    for i in 0..ruleset_count {
        let _ = store.create_ruleset(create_ruleset(i), None);
    }
    store
}

fn create_test_context(variant: usize) -> EvaluationContext {
    EvaluationContext::new(json!({
        "ram_gb": 8 * (variant % 8 + 1),
        "condition": if variant % 2 == 0 { "used" } else { "new" },
        "cpu": {"cpu_mark_multi": 8000 + (variant % 20) * 1000},
    }))
}

/// 运行并发估值
fn run_concurrent_evaluation(config: ConcurrencyConfig) -> ConcurrencyResult {
    let rulesets = Arc::new(seeded_store(config.ruleset_count).list_active());

    let mut handles = Vec::with_capacity(config.thread_count);
    let start = Instant::now();

    for thread_id in 0..config.thread_count {
        let rulesets = Arc::clone(&rulesets);
        let iterations = config.iterations_per_thread;

        handles.push(thread::spawn(move || {
            let evaluator = LayeredEvaluator::new(LayerConfig::default());
            let mut latencies = Vec::with_capacity(iterations);

            for i in 0..iterations {
                let context = create_test_context(thread_id * 1000 + i);
                let iter_start = Instant::now();
                let result = evaluator.evaluate(&rulesets, &[], 1000.0, &context);
                latencies.push(iter_start.elapsed().as_micros() as u64);
                black_box(result);
            }

            latencies
        }));
    }

    let mut all_latencies: Vec<u64> = Vec::new();
    for handle in handles {
        if let Ok(latencies) = handle.join() {
            all_latencies.extend(latencies);
        }
    }

    let total_duration = start.elapsed();
    let total_evaluations = all_latencies.len();

    all_latencies.sort_unstable();
    let sum: u64 = all_latencies.iter().sum();
    let p99_index = (total_evaluations as f64 * 0.99) as usize;

    ConcurrencyResult {
        total_evaluations,
        total_duration,
        throughput_per_sec: total_evaluations as f64 / total_duration.as_secs_f64(),
        avg_latency_us: sum as f64 / total_evaluations.max(1) as f64,
        p99_latency_us: all_latencies.get(p99_index).copied().unwrap_or(0),
    }
}

/// 目录并发读写
fn run_concurrent_store_access(thread_count: usize, operations_per_thread: usize) -> Duration {
    let store = seeded_store(20);
    let mut handles = Vec::with_capacity(thread_count);
    let start = Instant::now();

    for thread_id in 0..thread_count {
        let store = store.clone();
        handles.push(thread::spawn(move || {
            for i in 0..operations_per_thread {
                match i % 4 {
                    0 => {
                        black_box(store.find_by_name(&format!("Ruleset {}", i % 20)));
                    }
                    1 => {
                        let _ = store.create_ruleset(create_ruleset(thread_id * 10_000 + i), None);
                    }
                    2 => {
                        black_box(store.list_active().len());
                    }
                    _ => {
                        black_box(store.stats());
                    }
                }
            }
        }));
    }

    for handle in handles {
        let _ = handle.join();
    }

    start.elapsed()
}

fn bench_concurrent_evaluation(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_evaluation");

    for threads in [1usize, 2, 4, 8] {
        group.throughput(Throughput::Elements((threads * 50) as u64));
        group.bench_with_input(BenchmarkId::new("threads", threads), &threads, |b, threads| {
            b.iter(|| {
                black_box(run_concurrent_evaluation(ConcurrencyConfig {
                    thread_count: *threads,
                    iterations_per_thread: 50,
                    ruleset_count: 6,
                }))
            })
        });
    }

    group.finish();
}

fn bench_concurrent_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_store_access");

    for threads in [1usize, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::new("threads", threads), &threads, |b, threads| {
            b.iter(|| black_box(run_concurrent_store_access(*threads, 100)))
        });
    }

    group.finish();
}

/// 大目录场景
fn bench_high_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("high_load");
    group.sample_size(10);

    for ruleset_count in [10usize, 50, 200] {
        let rulesets = seeded_store(ruleset_count).list_active();
        let evaluator = LayeredEvaluator::new(LayerConfig::default());
        let context = create_test_context(0);

        group.throughput(Throughput::Elements(ruleset_count as u64));
        group.bench_with_input(BenchmarkId::new("rulesets", ruleset_count), &rulesets, |b, rulesets| {
            b.iter(|| evaluator.evaluate(rulesets, &[], 1000.0, black_box(&context)))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_concurrent_evaluation,
    bench_concurrent_store,
    bench_high_load,
);

criterion_main!(benches);

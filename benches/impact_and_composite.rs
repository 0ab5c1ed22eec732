//! Benchmarks for the two hot paths every message takes before
//! delivery: impact scoring (run on every send) and the fallback
//! composite processing strategy (run whenever the circuit-breaker
//! path is degraded).

use acgs2_agent_bus::impact::ImpactScorer;
use acgs2_agent_bus::processing::{
    CircuitBreakerProcessingStrategy, FallbackCompositeProcessingStrategy, HandlerRegistry,
    ProcessingStrategy, StandardProcessingStrategy,
};
use acgs2_agent_bus::validation::StaticHashValidationStrategy;
use acgs2_agent_bus::AgentMessage;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::Value;
use std::collections::HashMap;
use tokio::runtime::Runtime;

fn message_with_keywords(keyword_hits: usize) -> AgentMessage {
    let mut message = AgentMessage::new();
    let text = std::iter::repeat("critical security breach ")
        .take(keyword_hits)
        .collect::<String>();
    message.content.insert("text".to_string(), Value::String(text));
    message.from_agent = "bench-agent".to_string();
    message
}

fn bench_impact_scoring(c: &mut Criterion) {
    let scorer = ImpactScorer::new(None, None);

    let mut group = c.benchmark_group("impact_scoring");
    for hits in [0usize, 1, 5, 20].iter() {
        let message = message_with_keywords(*hits);
        group.bench_with_input(BenchmarkId::new("calculate_impact_score", hits), hits, |b, _| {
            b.iter(|| black_box(scorer.calculate_impact_score(black_box(&message))));
        });
    }
    group.finish();
}

fn bench_fallback_composite(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("fallback_composite_first_strategy_ok", |b| {
        b.to_async(&rt).iter_batched(
            || {
                let strategy = FallbackCompositeProcessingStrategy::new(vec![
                    Box::new(CircuitBreakerProcessingStrategy::new(Box::new(StaticHashValidationStrategy::new(true)))),
                ]);
                (strategy, AgentMessage::new())
            },
            |(strategy, mut message)| async move {
                let handlers: HandlerRegistry = HashMap::new();
                black_box(strategy.process(&mut message, &handlers).await)
            },
            criterion::BatchSize::SmallInput,
        );
    });

    c.bench_function("fallback_composite_falls_through_to_standard", |b| {
        b.to_async(&rt).iter_batched(
            || {
                let tripped = CircuitBreakerProcessingStrategy::new(Box::new(StaticHashValidationStrategy::new(true)));
                tripped.breaker().record_failure();
                tripped.breaker().record_failure();
                tripped.breaker().record_failure();
                let strategy = FallbackCompositeProcessingStrategy::new(vec![
                    Box::new(tripped),
                    Box::new(StandardProcessingStrategy::new(Box::new(StaticHashValidationStrategy::new(true)))),
                ]);
                (strategy, AgentMessage::new())
            },
            |(strategy, mut message)| async move {
                let handlers: HandlerRegistry = HashMap::new();
                black_box(strategy.process(&mut message, &handlers).await)
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_impact_scoring, bench_fallback_composite);
criterion_main!(benches);

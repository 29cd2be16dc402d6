use criterion::{criterion_group, criterion_main, Criterion};
use time::OffsetDateTime;
use trace_kernel_core::{
    enforce_link_consistency, ConsistencyOptions, DocumentTraces, EliminatedLinkedItem,
    EliminationKind, Item, ItemKind, LinkType, LinkedItem, RawTraceConfig, RecordAggregator,
    SourceBatch, TraceAnalyzer, TraceConfig,
};

fn mk_item(id: String, kind: ItemKind, category: &str) -> LinkedItem {
    let mut item = Item::new(id, kind, OffsetDateTime::UNIX_EPOCH);
    item.category = category.to_string();
    LinkedItem::new(item)
}

/// 100 system requirements, 1,000 software requirements and 2,000 tests. Every tenth
/// system requirement is filtered out so the cascade has work to do.
fn mk_batch() -> SourceBatch {
    let mut batch = SourceBatch::new();
    for sys in 0..100 {
        let item = mk_item(format!("SYS-{sys}"), ItemKind::SystemRequirement, "core");
        if sys % 10 == 0 {
            batch.push_eliminated(EliminatedLinkedItem::new(
                item,
                "bench filter",
                EliminationKind::FilteredOut,
            ));
        } else {
            batch.push_live(item);
        }
    }
    for swr in 0..1_000 {
        let category = if swr % 3 == 0 { "safety" } else { "core" };
        batch.push_live(
            mk_item(format!("SWR-{swr}"), ItemKind::SoftwareRequirement, category)
                .with_link(format!("SYS-{}", swr % 100), LinkType::Parent),
        );
    }
    for test in 0..2_000 {
        batch.push_live(
            mk_item(format!("TC-{test}"), ItemKind::SoftwareSystemTest, "core")
                .with_link(format!("SWR-{}", test % 1_000), LinkType::Tests),
        );
    }
    batch
}

fn mk_aggregator() -> RecordAggregator {
    let mut aggregator = RecordAggregator::new();
    if let Err(err) = aggregator.merge_source("bench", mk_batch()) {
        panic!("benchmark merge failed: {err}");
    }
    aggregator
}

fn bench_consistency(c: &mut Criterion) {
    let seed = mk_aggregator();
    let options = ConsistencyOptions::default();

    c.bench_function("link_consistency_3100_records", |b| {
        b.iter(|| {
            let mut aggregator = seed.clone();
            if let Err(err) = enforce_link_consistency(&mut aggregator, &options) {
                panic!("benchmark consistency failed: {err}");
            }
        });
    });
}

fn bench_trace_analysis(c: &mut Criterion) {
    let mut aggregator = mk_aggregator();
    if let Err(err) = enforce_link_consistency(&mut aggregator, &ConsistencyOptions::default()) {
        panic!("benchmark consistency failed: {err}");
    }
    let raw: RawTraceConfig = match serde_json::from_value(serde_json::json!({
        "truth": [
            {"id": "SystemRequirement", "abbreviation": "SYS"},
            {"id": "SoftwareRequirement", "abbreviation": "SWR"},
            {"id": "SoftwareSystemTest", "abbreviation": "TC"}
        ],
        "traces": {
            "SYS": [{"target": "SWR", "link_type": "child"}],
            "SWR": [{"target": "TC", "forward": ["safety"], "link_type": "tested_by"}]
        }
    })) {
        Ok(raw) => raw,
        Err(err) => panic!("benchmark config failed to parse: {err}"),
    };
    let config = match TraceConfig::from_raw(&raw) {
        Ok(config) => config,
        Err(err) => panic!("benchmark config is invalid: {err}"),
    };
    let documents = DocumentTraces::new();

    c.bench_function("trace_analysis_3100_records", |b| {
        b.iter(|| {
            let analyzer = TraceAnalyzer::new(&config, &aggregator, &documents);
            if let Err(err) = analyzer.analyze_all() {
                panic!("benchmark analysis failed: {err}");
            }
        });
    });
}

criterion_group!(consistency_benches, bench_consistency, bench_trace_analysis);
criterion_main!(consistency_benches);

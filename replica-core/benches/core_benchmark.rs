use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use replica_core::{diff_ids, evaluate, Document, OpKind, Operation};
use serde_json::json;

fn build_doc(edits: u64) -> Document {
    let mut doc = Document::new("bench", "1");
    doc.apply_op(Operation::new(OpKind::Add, "w0", 0, "bench", "1").with_value(json!({})));
    for date in 1..=edits {
        let source = format!("w{}", date % 4);
        let field = format!("f{}", date % 16);
        doc.apply_op(
            Operation::new(OpKind::Set, source, date, "bench", "1")
                .with_field(field)
                .with_value(json!(date)),
        );
    }
    doc
}

fn bench_fold(c: &mut Criterion) {
    let mut group = c.benchmark_group("Document");
    group.throughput(Throughput::Elements(1000));

    group.bench_function("apply_1k_in_order", |b| {
        b.iter(|| black_box(build_doc(1000)));
    });

    group.bench_function("distill_1k", |b| {
        let doc = build_doc(1000);
        b.iter(|| {
            let mut d = doc.clone();
            black_box(d.distill());
        })
    });

    group.bench_function("ops_to_send_1k", |b| {
        let doc = build_doc(1000);
        let version = "w0 500|w1 500".parse().unwrap();
        b.iter(|| black_box(doc.ops_to_send(&version)));
    });

    group.finish();
}

fn bench_diff_ids(c: &mut Criterion) {
    let mut group = c.benchmark_group("Query diff");
    let old: Vec<String> = (0..500).map(|i| format!("id{i}")).collect();
    let mut new = old.clone();
    new.retain(|id| !id.ends_with('7'));
    new.rotate_left(13);
    new.insert(100, "fresh".to_string());

    group.bench_function("diff_ids_500", |b| {
        b.iter(|| black_box(diff_ids(black_box(&old), black_box(&new))));
    });
    group.finish();
}

fn bench_evaluate(c: &mut Criterion) {
    let mut group = c.benchmark_group("Query");
    let docs: Vec<_> = (0..2000)
        .map(|i| json!({"_id": format!("{i}"), "age": i % 90, "city": if i % 3 == 0 { "Oslo" } else { "Rome" }}))
        .collect();
    let expr = json!({"city": "Oslo", "age": {"$gte": 30}, "$orderby": {"age": -1}, "$limit": 50});
    group.throughput(Throughput::Elements(docs.len() as u64));

    group.bench_function("evaluate_2k", |b| {
        b.iter(|| black_box(evaluate(&expr, docs.clone())));
    });
    group.finish();
}

criterion_group!(benches, bench_fold, bench_diff_ids, bench_evaluate);
criterion_main!(benches);

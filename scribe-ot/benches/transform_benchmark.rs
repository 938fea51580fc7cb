use criterion::{black_box, criterion_group, criterion_main, Criterion};
use scribe_ot::{compose, transform, Operation, TextOp, Tie};

/// A typing burst: `n` single-char inserts spread across a document.
fn typing_op(doc_len: usize, pos: usize, text: &str) -> TextOp {
    let mut op = TextOp::new();
    op.retain(pos).insert(text).retain(doc_len - pos);
    op
}

fn bench_transform_small(c: &mut Criterion) {
    let a = typing_op(1_000, 10, "x");
    let b = typing_op(1_000, 900, "y");

    c.bench_function("transform_insert_insert_1k", |bench| {
        bench.iter(|| black_box(transform(black_box(&a), black_box(&b), Tie::Left).unwrap()))
    });
}

fn bench_transform_fragmented(c: &mut Criterion) {
    // 100 interleaved edits on each side.
    let mut a = TextOp::new();
    let mut b = TextOp::new();
    for _ in 0..100 {
        a.retain(5).insert("ab").delete(2);
        b.retain(3).delete(1).retain(2).insert("z").delete(1);
    }

    c.bench_function("transform_fragmented_100", |bench| {
        bench.iter(|| black_box(transform(black_box(&a), black_box(&b), Tie::Right).unwrap()))
    });
}

fn bench_compose_chain(c: &mut Criterion) {
    let ops: Vec<TextOp> = (0..100).map(|i| typing_op(i, i, "k")).collect();

    c.bench_function("compose_chain_100", |bench| {
        bench.iter(|| {
            let mut acc = ops[0].clone();
            for op in &ops[1..] {
                acc = compose(&acc, op).unwrap();
            }
            black_box(acc)
        })
    });
}

fn bench_apply_10k(c: &mut Criterion) {
    let doc = "lorem ipsum ".repeat(1_000);
    let len = doc.chars().count();
    let op = typing_op(len, len / 2, "inserted");

    c.bench_function("apply_insert_12k_chars", |bench| {
        bench.iter(|| black_box(op.apply(black_box(&doc)).unwrap()))
    });
}

fn bench_codec(c: &mut Criterion) {
    let op = Operation::new(42, "alice", typing_op(1_000, 500, "hello"));
    let encoded = op.encode().unwrap();

    c.bench_function("operation_encode", |bench| {
        bench.iter(|| black_box(black_box(&op).encode().unwrap()))
    });
    c.bench_function("operation_decode", |bench| {
        bench.iter(|| black_box(Operation::decode(black_box(&encoded)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_transform_small,
    bench_transform_fragmented,
    bench_compose_chain,
    bench_apply_10k,
    bench_codec,
);
criterion_main!(benches);

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mdpad_core::{Operation, Reconciler, DocumentSnapshot};

fn typing_run(base: usize, keystrokes: usize) -> Vec<Operation> {
    (0..keystrokes)
        .map(|i| Operation::from_edit(base + i, base / 2 + i, 0, "x").unwrap())
        .collect()
}

fn bench_apply(c: &mut Criterion) {
    let text = "lorem ipsum dolor sit amet ".repeat(400);
    let len = text.chars().count();
    let op = Operation::from_edit(len, len / 2, 10, "consectetur").unwrap();

    c.bench_function("apply_10k_chars", |b| {
        b.iter(|| op.apply(black_box(&text)).unwrap())
    });
}

fn bench_compose_typing(c: &mut Criterion) {
    let ops = typing_run(1000, 200);

    c.bench_function("compose_200_keystrokes", |b| {
        b.iter(|| {
            let mut acc = ops[0].clone();
            for op in &ops[1..] {
                acc = acc.compose(black_box(op)).unwrap();
            }
            acc
        })
    });
}

fn bench_transform(c: &mut Criterion) {
    let a = Operation::from_edit(5000, 100, 20, "local change").unwrap();
    let b = Operation::from_edit(5000, 4000, 5, "remote change").unwrap();

    c.bench_function("transform_concurrent_splices", |bench| {
        bench.iter(|| black_box(&a).transform(black_box(&b)).unwrap())
    });
}

fn bench_reconciler_buffering(c: &mut Criterion) {
    let ops = typing_run(1000, 100);

    c.bench_function("reconciler_buffer_100_edits", |b| {
        b.iter(|| {
            let mut r = Reconciler::new(&DocumentSnapshot::new("a".repeat(1000), 0));
            for op in &ops {
                r.apply_client(op.clone()).unwrap();
            }
            r
        })
    });
}

criterion_group!(
    benches,
    bench_apply,
    bench_compose_typing,
    bench_transform,
    bench_reconciler_buffering
);
criterion_main!(benches);

//! Layout computation benchmarks
//!
//! Measures cold layout computation against the memoized path.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use native_bridge::layout::{calculate, FieldDecl};
use native_bridge::{AlignmentMode, CompositeKind, Platform, SemanticType, StructDef};

fn generate_fields(n: usize) -> Vec<FieldDecl> {
    (0..n)
        .map(|i| {
            let ty = match i % 6 {
                0 => SemanticType::Int8,
                1 => SemanticType::Int32,
                2 => SemanticType::Float64,
                3 => SemanticType::NativeLong,
                4 => SemanticType::array(SemanticType::Int16, 3),
                _ => SemanticType::RawPointer,
            };
            FieldDecl::new(format!("f{i}"), ty)
        })
        .collect()
}

fn bench_calculate(c: &mut Criterion) {
    let mut group = c.benchmark_group("calculate");
    let platform = Platform::current();

    for size in [4, 16, 64].iter() {
        let fields = generate_fields(*size);
        for mode in [AlignmentMode::GnuLike, AlignmentMode::MsvcLike, AlignmentMode::None] {
            group.bench_with_input(BenchmarkId::new(format!("{mode:?}"), size), &fields, |b, fields| {
                b.iter(|| calculate(black_box(fields), CompositeKind::Struct, mode, &platform, false))
            });
        }
    }

    group.finish();
}

fn bench_memoized(c: &mut Criterion) {
    let def = StructDef::builder("Wide")
        .field("a", SemanticType::Int8)
        .field("b", SemanticType::Float64)
        .field("c", SemanticType::Int32)
        .build()
        .unwrap();
    def.size().unwrap();

    c.bench_function("memoized_size", |b| b.iter(|| black_box(&def).size()));
}

criterion_group!(benches, bench_calculate, bench_memoized);
criterion_main!(benches);

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use bregex_core::{OptionFlags, Regex};

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");
    let pattern = "a(b|c|d)*xyz";

    group.bench_function("regex_compile", |b| {
        b.iter(|| {
            let compiled = Regex::new(black_box(pattern), false).unwrap();
            black_box(compiled);
        })
    });

    group.finish();
}

fn bench_match(c: &mut Criterion) {
    let mut group = c.benchmark_group("match");
    let input_match = "zzzaacccdddbcdxyzend";
    let input_no_match = "zzzaacccdddbcdxyyend";

    let regex = Regex::new("a(b|c|d)*xyz", false).unwrap();

    group.bench_function("regex_match_true", |b| {
        b.iter(|| {
            let matched = regex.is_match(black_box(input_match)).unwrap();
            black_box(matched);
        })
    });

    group.bench_function("regex_match_false", |b| {
        b.iter(|| {
            let matched = regex.is_match(black_box(input_no_match)).unwrap();
            black_box(matched);
        })
    });

    group.finish();
}

fn bench_literal_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("literal_scan");
    let text = format!("{}needle{}", "haystack ".repeat(2000), "tail".repeat(100));

    let bm = Regex::new("needle", false).unwrap();
    group.bench_function("regex_bm_forward", |b| {
        b.iter(|| black_box(bm.find(black_box(text.as_bytes())).unwrap()))
    });

    group.bench_function("regex_bm_backward", |b| {
        b.iter(|| {
            let found = bm
                .search(black_box(text.as_bytes()), text.len(), 0, OptionFlags::NONE)
                .unwrap();
            black_box(found);
        })
    });

    let ic = Regex::new("NEEDLE", true).unwrap();
    group.bench_function("regex_ignore_case", |b| {
        b.iter(|| black_box(ic.find(black_box(text.as_bytes())).unwrap()))
    });

    group.finish();
}

fn bench_backreference(c: &mut Criterion) {
    let mut group = c.benchmark_group("backreference");
    let regex = Regex::new("(abc)\\1", false).unwrap();

    group.bench_function("regex_backref_match_true", |b| {
        b.iter(|| {
            let matched = regex.is_match(black_box("abcabc")).unwrap();
            black_box(matched);
        })
    });

    group.bench_function("regex_backref_match_false", |b| {
        b.iter(|| {
            let matched = regex.is_match(black_box("abcabd")).unwrap();
            black_box(matched);
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_compile,
    bench_match,
    bench_literal_scan,
    bench_backreference
);
criterion_main!(benches);

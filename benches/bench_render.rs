#![allow(
    clippy::tests_outside_test_module,
    clippy::unwrap_used,
    reason = "benchmark"
)]

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use promptlate::{ParseConfig, Parameters, Template, parse};

mod utils;

fn render_benchmark(c: &mut Criterion) {
    // Load the prompt from file
    let source = include_str!("support_prompt.promptl");
    let template = Template::new(source).unwrap();

    // Generate 100 random parameter sets
    let parameters: Vec<Parameters> = utils::generate_random_parameters(100)
        .into_iter()
        .map(|value| Parameters::try_from(value).unwrap())
        .collect();

    let mut group = c.benchmark_group("Prompt Compilation");
    group.sample_size(50);

    group.bench_function("parse", |b| {
        b.iter(|| black_box(parse(black_box(source), &ParseConfig::default()).unwrap()));
    });

    group.bench_function("render", |b| {
        b.iter(|| {
            for parameters in &parameters {
                black_box(template.render(parameters).unwrap());
            }
        });
    });

    group.bench_function("parse_and_render", |b| {
        b.iter(|| {
            for parameters in &parameters {
                black_box(pollster::block_on(promptlate::render(source, parameters)).unwrap());
            }
        });
    });

    group.finish();
}

criterion_group!(benches, render_benchmark);
criterion_main!(benches);

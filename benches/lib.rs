use criterion::{criterion_group, criterion_main};

use fit::bench_fit;

use render::{bench_convolve, bench_render};

criterion_group!(benches, bench_render, bench_convolve, bench_fit);
criterion_main!(benches);

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use num_complex::Complex64;
use rand::prelude::*;
use spcm_console::{
    ddc::Downconverter,
    result::phase_correct,
    rx::deinterleave,
};

const RECORD_FRAMES: usize = 20_000;

fn benchmark(c: &mut Criterion) {
    let mut rng = rand::thread_rng();

    let mut interleaved = vec![0i16; RECORD_FRAMES * 2];
    rng.fill(&mut interleaved[..]);
    let record: Vec<f64> = interleaved.iter().map(|s| *s as f64 / 32767.0).collect();
    let signal: Vec<Complex64> = (0..512)
        .map(|_| Complex64::new(rng.gen(), rng.gen()))
        .collect();
    let reference: Vec<Complex64> = (0..512)
        .map(|_| Complex64::new(rng.gen(), rng.gen()))
        .collect();
    let ddc = Downconverter::new(400, 2.0395e6, 20e6);

    c.bench_function("deinterleave gate record", |b| {
        b.iter(|| deinterleave(black_box(&interleaved), black_box(2)))
    });

    c.bench_function("downconvert gate", |b| {
        b.iter(|| ddc.apply(black_box(&record[..RECORD_FRAMES])))
    });

    c.bench_function("phase correction", |b| {
        b.iter(|| phase_correct(black_box(&signal), black_box(&reference)))
    });
}

criterion_group!(benches, benchmark);
criterion_main!(benches);

//! Hot-path benchmarks
//!
//! The relay touches every audio byte twice per frame (transcode for the
//! client leg, linear expansion for the accumulator); these benchmarks
//! track the per-frame cost at the provider's 20 ms cadence.

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};

use callbridge_gateway::audio::{self, CompandingLaw};

fn bench_transcode(c: &mut Criterion) {
    // One 20 ms frame at 8 kHz: 160 companded samples.
    let frame: Vec<u8> = (0..160u32).map(|i| (i.wrapping_mul(7) % 256) as u8).collect();

    c.bench_function("transcode_20ms_alaw_to_mulaw", |b| {
        b.iter(|| {
            audio::transcode_frame(
                black_box(&frame),
                CompandingLaw::ALaw,
                CompandingLaw::MuLaw,
            )
        })
    });

    c.bench_function("transcode_20ms_same_law_passthrough", |b| {
        b.iter(|| {
            audio::transcode_frame(
                black_box(&frame),
                CompandingLaw::MuLaw,
                CompandingLaw::MuLaw,
            )
        })
    });

    c.bench_function("expand_20ms_to_linear16", |b| {
        b.iter(|| audio::expand_to_linear16(black_box(&frame), CompandingLaw::MuLaw))
    });
}

criterion_group!(benches, bench_transcode);
criterion_main!(benches);

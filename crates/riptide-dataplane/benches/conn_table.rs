//! Fast-path benchmarks
//!
//! Table lookup, conntrack stepping and wheel scheduling are the three
//! per-packet costs; all must stay branch-light and allocation-free.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use riptide_common::{Tuple2, Tuple4};
use riptide_dataplane::conntrack::{next_state, Dir, FlagClass, TcpState};
use riptide_dataplane::table::FlowMap;
use riptide_dataplane::wheel::TimerWheel;

fn flow_key(i: u32) -> Tuple4 {
    Tuple4::new(
        Tuple2::new(0xc0a8_0000 | (i & 0xFFFF), (i % 28_000) as u16 + 1024),
        Tuple2::new(0x0a00_0001, 80),
    )
}

fn bench_table_find(c: &mut Criterion) {
    let mut map: FlowMap<Tuple4, u32> = FlowMap::with_capacity(1 << 20);
    let mut stored = Vec::new();
    for i in 0..500_000u32 {
        let key = flow_key(i);
        if map.emplace(key, i).is_some() {
            stored.push(key);
        }
    }

    let mut group = c.benchmark_group("table");
    group.throughput(Throughput::Elements(1));
    group.bench_function("find_hit", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 1) % stored.len();
            black_box(map.find(&stored[i]))
        })
    });
    group.bench_function("find_miss", |b| {
        let key = flow_key(900_000);
        b.iter(|| black_box(map.find(&key)))
    });
    group.finish();
}

fn bench_table_emplace_remove(c: &mut Criterion) {
    let mut group = c.benchmark_group("table");
    group.throughput(Throughput::Elements(1));
    group.bench_function("emplace_remove", |b| {
        let mut map: FlowMap<Tuple4, u32> = FlowMap::with_capacity(1 << 16);
        let mut i = 0u32;
        b.iter(|| {
            i = i.wrapping_add(1);
            let key = flow_key(i);
            map.emplace(key, i);
            map.remove(&key)
        })
    });
    group.finish();
}

fn bench_conntrack_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("conntrack");
    group.throughput(Throughput::Elements(1));
    group.bench_function("next_state", |b| {
        b.iter(|| {
            black_box(next_state(
                black_box(TcpState::Established),
                black_box(Dir::Original),
                black_box(FlagClass::Ack),
            ))
        })
    });
    group.finish();
}

fn bench_wheel(c: &mut Criterion) {
    let mut group = c.benchmark_group("wheel");
    group.throughput(Throughput::Elements(1));
    group.bench_function("schedule_cancel", |b| {
        let mut wheel: TimerWheel<u32> = TimerWheel::with_seed(42);
        b.iter(|| {
            let t = wheel.schedule(1, 1200);
            wheel.cancel(t)
        })
    });
    group.bench_function("advance_idle_tick", |b| {
        let mut wheel: TimerWheel<u32> = TimerWheel::with_seed(42);
        wheel.schedule(1, u32::MAX as u64);
        b.iter(|| black_box(wheel.advance(1)))
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_table_find,
    bench_table_emplace_remove,
    bench_conntrack_step,
    bench_wheel
);
criterion_main!(benches);

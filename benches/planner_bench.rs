// Benchmark for planner enqueue and look-ahead throughput
// Run with: cargo bench

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use criterion::{criterion_group, criterion_main, Criterion};
use stepcore::config::{Config, KinematicConfig, KinematicsType};
use stepcore::motion::kinematics::{create_kinematics, Kinematics};
use stepcore::motion::planner::{BlockBuffer, Planner};
use stepcore::dispatch::{translate, DispatchSettings};

fn planner(kinematics: KinematicsType) -> Planner {
    let mut config = Config::default();
    config.printer.kinematics = kinematics;
    let config = KinematicConfig::from_config(&config);
    let buffer = Arc::new(BlockBuffer::new(config.block_buffer_size, Arc::new(AtomicBool::new(false))));
    let kinematics: Arc<dyn Kinematics> = Arc::from(create_kinematics(&config));
    Planner::new(config, kinematics, buffer)
}

/// Plan `moves` short segments around a circle, retiring blocks as a dispatcher would.
fn plan_circle(p: &mut Planner, centre: [f64; 2], moves: usize) {
    let capacity = p.buffer().capacity();
    for i in 0..moves {
        if p.occupancy() == capacity - 1 {
            let tail = p.buffer().lock().tail();
            p.buffer().begin(tail);
            p.buffer().retire(tail);
        }
        let angle = i as f64 * std::f64::consts::TAU / 360.0;
        let target = [centre[0] + 50.0 * angle.cos(), centre[1] + 50.0 * angle.sin(), 0.2, i as f64 * 0.02];
        let _ = p.enqueue_move(target, 80.0, 0);
    }
}

fn bench_planner(c: &mut Criterion) {
    c.bench_function("plan 1k cartesian segments", |b| {
        b.iter(|| {
            let mut p = planner(KinematicsType::Cartesian);
            plan_circle(&mut p, [100.0, 100.0], 1_000);
        });
    });
    c.bench_function("plan 1k delta segments", |b| {
        b.iter(|| {
            let mut p = planner(KinematicsType::Delta);
            p.set_position([50.0, 0.0, 0.2, 0.0]).unwrap();
            plan_circle(&mut p, [0.0, 0.0], 1_000);
        });
    });
}

fn bench_translate(c: &mut Criterion) {
    let mut p = planner(KinematicsType::Cartesian);
    plan_circle(&mut p, [100.0, 100.0], 15);
    let blocks = p.snapshot();
    let settings = DispatchSettings::from_config(&Config::default());
    c.bench_function("translate buffered blocks", |b| {
        b.iter(|| blocks.iter().map(|block| translate(block, &settings)).count());
    });
}

criterion_group!(benches, bench_planner, bench_translate);
criterion_main!(benches);

// benches/bench_decision_cycle.rs
use criterion::{
    black_box, criterion_group, criterion_main, AxisScale, BatchSize, BenchmarkId, Criterion,
    PlotConfiguration,
};
use signal_coordination::config::{IntersectionConfig, PhaseConfig, TimingConfig};
use signal_coordination::control_system::{ControllerSettings, SignalController};
use signal_coordination::models::intersection::LaneId;
use signal_coordination::models::vehicle::{VehicleId, VehicleType};
use std::time::Duration;

// Intersection with `phases` phases, two lanes each, all mutually conflicting.
fn build_controller(phases: usize) -> SignalController {
    let config = IntersectionConfig {
        id: "bench".to_string(),
        lanes: (0..phases * 2).map(|i| format!("lane{}", i)).collect(),
        phases: (0..phases)
            .map(|p| PhaseConfig {
                name: format!("P{}", p),
                lanes: vec![format!("lane{}", 2 * p), format!("lane{}", 2 * p + 1)],
                min_green: None,
                max_green: None,
            })
            .collect(),
        conflicts: None,
        default_phase: None,
        resilience: Vec::new(),
    };
    let intersection = config
        .build(&TimingConfig::default())
        .expect("bench intersection is valid");
    SignalController::new(intersection, ControllerSettings::default())
}

// Queues `vehicles` arrivals spread over every lane.
fn load_vehicles(controller: &mut SignalController, vehicles: u64) {
    let lanes = controller.intersection().lanes.clone();
    for v in 0..vehicles {
        let lane: &LaneId = &lanes[(v as usize) % lanes.len()];
        controller
            .announce_arrival(
                VehicleId(v),
                lane,
                VehicleType::Car.priority(),
                VehicleType::Car.clearance_ticks(),
                0,
            )
            .expect("lane belongs to the bench intersection");
    }
}

fn bench_decision_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("decision_cycle");

    group.sample_size(100);
    group.measurement_time(Duration::from_secs(5));
    group.warm_up_time(Duration::from_secs(2));
    group.plot_config(PlotConfiguration::default().summary_scale(AxisScale::Logarithmic));

    for &(phases, vehicles) in [(2, 50), (4, 200), (8, 1000)].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}_phases_{}_vehicles", phases, vehicles)),
            &(phases, vehicles),
            |b, &(phases, vehicles)| {
                b.iter_batched(
                    || {
                        let mut controller = build_controller(phases);
                        load_vehicles(&mut controller, vehicles);
                        controller
                    },
                    // One minute of simulated time per batch.
                    |mut controller| {
                        for now in 1..=60 {
                            black_box(controller.decision_cycle(now));
                        }
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_decision_cycle);
criterion_main!(benches);

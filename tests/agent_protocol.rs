// tests/agent_protocol.rs
use signal_coordination::communication::{phase_topic, Address, MessageBus, Payload};
use signal_coordination::config::Config;
use signal_coordination::control_system::{run_signal_controller, SignalController};
use signal_coordination::emergency::{run_preemption_channel, PreemptionChannel};
use signal_coordination::global_variables::ADDR_PREEMPTION;
use signal_coordination::models::intersection::{IntersectionId, SignalState};
use signal_coordination::models::vehicle::{VehicleId, VehicleType};
use signal_coordination::monitoring::{MemoryMetricsSink, MetricsSink};
use signal_coordination::shared_data::SimClock;
use signal_coordination::simulation_engine::{run_simulation, run_vehicle_agent, AgentSettings, VehicleAgent};
use std::time::Duration;

const TICK: Duration = Duration::from_millis(100);

#[tokio::test(start_paused = true)]
async fn emergency_vehicle_preempts_and_releases_over_the_bus() {
    let config = Config::default();
    let intersection = config.build_intersections().unwrap().remove(0);
    let i1 = intersection.id.clone();
    let bus = MessageBus::new();
    let clock = SimClock::start(TICK);

    let channel = PreemptionChannel::new([(i1.clone(), intersection.lanes.clone())], 5);
    let channel_box = bus.register(Address::new(ADDR_PREEMPTION));
    let preemption = tokio::spawn(run_preemption_channel(channel, channel_box, bus.clone(), clock));

    let controller_box = bus.register(Address::controller(&i1));
    let controller = SignalController::new(intersection, config.controller_settings());
    let controller_task = tokio::spawn(run_signal_controller(controller, controller_box, bus.clone(), clock, 10));

    let observer = Address::new("observer");
    let mut broadcasts = bus.register(observer.clone());
    bus.subscribe(&observer, &phase_topic(&i1));

    let ambulance = VehicleAgent::new(
        VehicleId(7),
        VehicleType::EmergencyVan,
        i1.clone(),
        "E".into(),
        AgentSettings::default(),
    );
    let mailbox = bus.register(Address::vehicle(ambulance.id));
    let waited = tokio::time::timeout(
        TICK * 30,
        run_vehicle_agent(ambulance, mailbox, bus.clone(), clock),
    )
    .await
    .expect("ambulance should clear the intersection");
    assert!(waited.is_some());
    assert!(!bus.is_registered(&Address::vehicle(VehicleId(7))));

    // Let the release reach the controller and one more cycle run.
    tokio::time::sleep(TICK * 3).await;

    let seen: Vec<SignalState> = broadcasts
        .drain()
        .unwrap()
        .into_iter()
        .filter_map(|e| match e.payload {
            Payload::PhaseBroadcast(b) => Some(b.signal),
            _ => None,
        })
        .collect();
    assert!(seen.iter().any(|s| matches!(s, SignalState::Preempted { .. })));
    assert!(seen.iter().any(|s| s.is_clearance()));
    assert!(matches!(seen.last(), Some(SignalState::Green { .. })));

    bus.close();
    preemption.await.unwrap();
    controller_task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn wire_bytes_reach_the_controller_and_bad_ones_are_rejected() {
    let config = Config::default();
    let intersection = config.build_intersections().unwrap().remove(0);
    let bus = MessageBus::new();
    let clock = SimClock::start(TICK);
    let controller_box = bus.register(Address::controller(&IntersectionId::from("I1")));
    let controller = SignalController::new(intersection, config.controller_settings());
    let task = tokio::spawn(run_signal_controller(controller, controller_box, bus.clone(), clock, 10));

    let hint = br#"{"from":"coordinator","to":"controller/I1","type":"CORRIDOR_HINT","timestamp":0,
        "payload":{"corridor":"main_ew","intersection_id":"I1","favor_phase":"EW_GREEN",
        "strength":0.8,"issued_at":0,"valid_until":10}}"#;
    assert_eq!(bus.deliver_wire(hint).unwrap(), 1);

    let unknown = br#"{"from":"x","to":"controller/I1","type":"TELEPORT","timestamp":0,"payload":{}}"#;
    assert!(bus.deliver_wire(unknown).is_err());

    tokio::time::sleep(TICK * 2).await;
    bus.close();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn full_simulation_produces_departures_and_controller_metrics() {
    let mut config = Config::default();
    config.timing.tick_millis = 100;
    config.vehicles.spawn_probability = 0.5;
    config.metrics_csv = None;

    let memory = MemoryMetricsSink::new();
    let sinks: Vec<Box<dyn MetricsSink>> = vec![Box::new(memory.clone())];
    let report = run_simulation(&config, 80, sinks).await.unwrap();

    assert!(report.vehicles_spawned > 0);
    assert!(report.vehicles_departed > 0);
    assert!(report.vehicles_departed <= report.vehicles_spawned);
    assert!(report.metrics.controller_reports > 0);

    let records = memory.records();
    let departures = records.iter().filter(|r| r.is_vehicle()).count() as u64;
    assert_eq!(departures, report.metrics.vehicles_departed);
    assert!(records
        .iter()
        .any(|r| !r.is_vehicle() && r.green_phase.is_some()));
}

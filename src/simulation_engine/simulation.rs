use log::{info, warn};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};

use crate::communication::amqp_bridge::{spawn_disruption_consumer, AmqpMetricsSink};
use crate::communication::channel::{Address, MessageBus};
use crate::config::{Config, VehicleConfig};
use crate::control_system::traffic_light_controller::{run_signal_controller, SignalController};
use crate::coordinator::central_coordinator::run_coordinator;
use crate::emergency::preemption_channel::{run_preemption_channel, PreemptionChannel};
use crate::error::ConfigError;
use crate::flow_analyzer::disruption_feed::{run_disruption_feed, DisruptionFeed};
use crate::flow_analyzer::predictive_model::{
    CompositePredictor, CongestionPredictor, RandomIncidentPredictor, ScriptedPredictor,
};
use crate::global_variables::{
    ADDR_COORDINATOR, ADDR_DISRUPTION_FEED, ADDR_METRICS_COLLECTOR, ADDR_PREEMPTION,
    TOPIC_DISRUPTIONS, TOPIC_METRICS,
};
use crate::models::intersection::{Intersection, IntersectionId, LaneId};
use crate::models::vehicle::{VehicleId, VehicleType};
use crate::monitoring::traffic_monitoring_system::{run_metrics_collector, MetricsSink, MetricsSummary};
use crate::shared_data::{SimClock, Tick};
use crate::simulation_engine::vehicles::{run_vehicle_agent, VehicleAgent};

/// Outcome of one simulation run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationReport {
    pub ticks: Tick,
    pub vehicles_spawned: u64,
    pub vehicles_departed: u64,
    /// Mean wait of departed vehicles, in ticks.
    pub mean_wait: f64,
    pub max_wait: Tick,
    pub metrics: MetricsSummary,
}

/// Car/Truck/Bus/EmergencyVan split from cumulative shares.
pub fn pick_vehicle_type(rand_val: f64, shares: &VehicleConfig) -> VehicleType {
    if rand_val < shares.car_share {
        VehicleType::Car
    } else if rand_val < shares.car_share + shares.truck_share {
        VehicleType::Truck
    } else if rand_val < shares.car_share + shares.truck_share + shares.bus_share {
        VehicleType::Bus
    } else {
        VehicleType::EmergencyVan
    }
}

fn build_predictor(config: &Config, ids: &[IntersectionId]) -> CompositePredictor {
    let mut predictor =
        CompositePredictor::new().with(ScriptedPredictor::new(config.disruptions.scripted.clone()));
    if config.disruptions.congestion {
        predictor = predictor.with(CongestionPredictor::default());
    }
    if config.disruptions.incident_probability > 0.0 {
        predictor = predictor.with(RandomIncidentPredictor::new(
            config.seed.wrapping_add(1),
            ids.to_vec(),
            config.disruptions.incident_probability,
        ));
    }
    predictor
}

/// Runs every agent for `ticks` ticks, then shuts the bus down and collects
/// the results. Vehicles still waiting at shutdown are not counted as
/// departed.
pub async fn run_simulation(
    config: &Config,
    ticks: Tick,
    mut sinks: Vec<Box<dyn MetricsSink>>,
) -> Result<SimulationReport, ConfigError> {
    config.validate()?;
    let intersections: Vec<Intersection> = config.build_intersections()?;
    let ids: Vec<IntersectionId> = intersections.iter().map(|i| i.id.clone()).collect();
    let lanes: Vec<Vec<LaneId>> = intersections.iter().map(|i| i.lanes.clone()).collect();

    let bus = MessageBus::new();
    let clock = SimClock::start(Duration::from_millis(config.timing.tick_millis));
    let mut agents = JoinSet::new();

    info!(
        "Starting simulation: {} intersections, {} corridors, {} ticks",
        intersections.len(),
        config.corridors.len(),
        ticks
    );

    // Preemption channel first so no claim request finds it missing.
    let preemption = PreemptionChannel::new(
        intersections.iter().map(|i| (i.id.clone(), i.lanes.clone())),
        config.emergency.grace_ticks,
    );
    let mailbox = bus.register(Address::new(ADDR_PREEMPTION));
    agents.spawn(run_preemption_channel(preemption, mailbox, bus.clone(), clock));

    for intersection in intersections {
        let address = Address::controller(&intersection.id);
        let mailbox = bus.register(address.clone());
        bus.subscribe(&address, TOPIC_DISRUPTIONS);
        let controller = SignalController::new(intersection, config.controller_settings());
        agents.spawn(run_signal_controller(
            controller,
            mailbox,
            bus.clone(),
            clock,
            config.timing.metrics_period_ticks,
        ));
    }

    let collector_address = Address::new(ADDR_METRICS_COLLECTOR);
    let collector_mailbox = bus.register(collector_address.clone());
    bus.subscribe(&collector_address, TOPIC_METRICS);
    if let Some(amqp) = &config.amqp {
        sinks.push(Box::new(AmqpMetricsSink::spawn(&amqp.url, &amqp.metrics_queue)));
        let consumer =
            spawn_disruption_consumer(&amqp.url, &amqp.disruption_queue, bus.clone(), clock);
        agents.spawn(async move {
            if let Err(e) = consumer.await {
                warn!("Disruption consumer panicked: {}", e);
            }
        });
    }
    let collector = tokio::spawn(run_metrics_collector(sinks, collector_mailbox, clock));

    let feed_address = Address::new(ADDR_DISRUPTION_FEED);
    let feed_mailbox = bus.register(feed_address.clone());
    bus.subscribe(&feed_address, TOPIC_METRICS);
    bus.subscribe(&feed_address, TOPIC_DISRUPTIONS);
    let feed = DisruptionFeed::new(Box::new(build_predictor(config, &ids)));
    agents.spawn(run_disruption_feed(
        feed,
        feed_mailbox,
        bus.clone(),
        clock,
        config.disruptions.poll_ticks,
    ));

    let coordinator_address = Address::new(ADDR_COORDINATOR);
    let coordinator_mailbox = bus.register(coordinator_address.clone());
    bus.subscribe(&coordinator_address, TOPIC_METRICS);
    bus.subscribe(&coordinator_address, TOPIC_DISRUPTIONS);
    agents.spawn(run_coordinator(
        config.corridors.clone(),
        config.coordinator,
        coordinator_mailbox,
        bus.clone(),
        clock,
    ));

    // Vehicle spawner.
    let mut rng = SmallRng::seed_from_u64(config.seed);
    let mut vehicles: JoinSet<Option<Tick>> = JoinSet::new();
    let mut next_id: u64 = 1;
    let mut ticker = interval(clock.tick_duration());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    for _ in 0..ticks {
        ticker.tick().await;
        for (id, lanes) in ids.iter().zip(&lanes) {
            if lanes.is_empty() || !rng.random_bool(config.vehicles.spawn_probability) {
                continue;
            }
            let lane = lanes[rng.random_range(0..lanes.len())].clone();
            let vehicle_type = pick_vehicle_type(rng.random_range(0.0..1.0), &config.vehicles);
            let agent = VehicleAgent::new(
                VehicleId(next_id),
                vehicle_type,
                id.clone(),
                lane,
                config.agent_settings(),
            );
            next_id += 1;
            let mailbox = bus.register(Address::vehicle(agent.id));
            vehicles.spawn(run_vehicle_agent(agent, mailbox, bus.clone(), clock));
        }
    }

    info!("Simulation finished at tick {}; shutting down agents", clock.now());
    bus.close();

    let mut report = SimulationReport {
        ticks,
        vehicles_spawned: next_id - 1,
        ..SimulationReport::default()
    };
    let mut total_wait: Tick = 0;
    while let Some(result) = vehicles.join_next().await {
        match result {
            Ok(Some(waited)) => {
                report.vehicles_departed += 1;
                total_wait += waited;
                report.max_wait = report.max_wait.max(waited);
            }
            Ok(None) => {}
            Err(e) => warn!("Vehicle task failed: {}", e),
        }
    }
    if report.vehicles_departed > 0 {
        report.mean_wait = total_wait as f64 / report.vehicles_departed as f64;
    }
    while let Some(result) = agents.join_next().await {
        if let Err(e) = result {
            warn!("Agent task failed: {}", e);
        }
    }
    report.metrics = match collector.await {
        Ok(summary) => summary,
        Err(e) => {
            warn!("Metrics collector failed: {}", e);
            MetricsSummary::default()
        }
    };

    info!(
        "Spawned {} vehicles, {} departed, mean wait {:.2} ticks",
        report.vehicles_spawned, report.vehicles_departed, report.mean_wait
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vehicle_split_follows_cumulative_shares() {
        let shares = VehicleConfig::default();
        assert_eq!(pick_vehicle_type(0.2, &shares), VehicleType::Car);
        assert_eq!(pick_vehicle_type(0.6, &shares), VehicleType::Truck);
        assert_eq!(pick_vehicle_type(0.9, &shares), VehicleType::Bus);
        assert_eq!(pick_vehicle_type(0.995, &shares), VehicleType::EmergencyVan);
    }
}

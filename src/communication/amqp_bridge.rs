//! RabbitMQ bridge for the two external collaborators: the metrics sink and
//! the disruption predictor's event queue. amiquip is blocking, so each side
//! runs on its own blocking task.

use amiquip::{
    Connection, ConsumerMessage, ConsumerOptions, Exchange, Publish, QueueDeclareOptions,
    Result as AmiquipResult,
};
use log::{info, warn};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::{self, JoinHandle};

use crate::communication::channel::{Address, MessageBus};
use crate::communication::messages::{DisruptionUpdate, Envelope, Payload};
use crate::error::{ProtocolError, SinkError};
use crate::global_variables::{ADDR_DISRUPTION_QUEUE, TOPIC_DISRUPTIONS};
use crate::models::disruption::DisruptionEvent;
use crate::monitoring::traffic_monitoring_system::{MetricRecord, MetricsSink};
use crate::shared_data::SimClock;

/// How often the blocking consumer checks whether the bus shut down.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Publishes each metric record as JSON to a queue.
pub struct AmqpMetricsSink {
    tx: UnboundedSender<Vec<u8>>,
    name: String,
}

impl AmqpMetricsSink {
    /// Starts the publisher. Must be called inside a tokio runtime.
    pub fn spawn(url: &str, queue: &str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let url = url.to_string();
        let queue_name = queue.to_string();
        let publisher = task::spawn_blocking(move || -> AmiquipResult<()> {
            let mut connection = Connection::insecure_open(&url)?;
            let channel = connection.open_channel(None)?;
            let exchange = Exchange::direct(&channel);
            channel.queue_declare(queue_name.as_str(), QueueDeclareOptions::default())?;
            info!("Publishing metric records to '{}'", queue_name);
            while let Some(body) = rx.blocking_recv() {
                exchange.publish(Publish::new(&body, queue_name.as_str()))?;
            }
            connection.close()
        });
        let name = format!("amqp:{queue}");
        let label = name.clone();
        tokio::spawn(async move {
            match publisher.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Metrics sink {} stopped: {}", label, e),
                Err(e) => warn!("Metrics sink {} panicked: {}", label, e),
            }
        });
        Self { tx, name }
    }
}

impl MetricsSink for AmqpMetricsSink {
    fn append(&mut self, record: &MetricRecord) -> Result<(), SinkError> {
        let body = serde_json::to_vec(record)?;
        self.tx
            .send(body)
            .map_err(|_| SinkError::Closed(self.name.clone()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Decodes one delivery from the predictor queue.
pub fn decode_disruption(body: &[u8]) -> Result<DisruptionEvent, ProtocolError> {
    let event: DisruptionEvent =
        serde_json::from_slice(body).map_err(|e| ProtocolError::MalformedPayload {
            kind: "DISRUPTION_EVENT".to_string(),
            reason: e.to_string(),
        })?;
    event.validate()?;
    Ok(event)
}

fn publish_update(bus: &MessageBus, clock: &SimClock, update: DisruptionUpdate) {
    let envelope = Envelope::topic(
        Address::new(ADDR_DISRUPTION_QUEUE),
        TOPIC_DISRUPTIONS,
        clock.now(),
        Payload::DisruptionEvent(update),
    );
    if let Err(e) = bus.send(envelope) {
        warn!("Disruption update not delivered: {}", e);
    }
}

/// Consumes `DisruptionEvent` JSON from an external queue and republishes
/// it on the disruptions topic. If the broker is unreachable or the consumer
/// ends, subscribers get a `FeedUnavailable` and fall back to undisrupted
/// weighting.
pub fn spawn_disruption_consumer(
    url: &str,
    queue: &str,
    bus: MessageBus,
    clock: SimClock,
) -> JoinHandle<()> {
    let url = url.to_string();
    let queue_name = queue.to_string();
    task::spawn_blocking(move || {
        let consume = || -> AmiquipResult<()> {
            let mut connection = Connection::insecure_open(&url)?;
            let channel = connection.open_channel(None)?;
            let queue = channel.queue_declare(queue_name.as_str(), QueueDeclareOptions::default())?;
            let consumer = queue.consume(ConsumerOptions::default())?;
            info!("Waiting for disruption events on '{}'", queue_name);
            loop {
                let message = match consumer.receiver().recv_timeout(POLL_INTERVAL) {
                    Ok(message) => message,
                    Err(e) if e.is_timeout() => {
                        if bus.is_closed() {
                            break;
                        }
                        continue;
                    }
                    Err(_) => break,
                };
                match message {
                    ConsumerMessage::Delivery(delivery) => {
                        match decode_disruption(&delivery.body) {
                            Ok(event) => {
                                publish_update(&bus, &clock, DisruptionUpdate::Event { event })
                            }
                            Err(e) => warn!("Dropped disruption from '{}': {}", queue_name, e),
                        }
                        consumer.ack(delivery)?;
                    }
                    other => {
                        warn!("Disruption consumer ended: {:?}", other);
                        break;
                    }
                }
            }
            connection.close()
        };
        let reason = match consume() {
            Ok(()) if bus.is_closed() => return,
            Ok(()) => "consumer ended".to_string(),
            Err(e) => e.to_string(),
        };
        warn!("Disruption queue '{}' unavailable: {}", queue_name, reason);
        publish_update(&bus, &clock, DisruptionUpdate::FeedUnavailable { reason });
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_valid_events_and_rejects_bad_severity() {
        let ok = br#"{"kind":"weather","area":["I1"],"severity":0.7,"valid_from":0,"valid_to":30}"#;
        assert_eq!(decode_disruption(ok).unwrap().severity, 0.7);

        let bad = br#"{"kind":"weather","area":["I1"],"severity":1.7,"valid_from":0,"valid_to":30}"#;
        assert!(decode_disruption(bad).is_err());

        let unknown = br#"{"kind":"meteor","area":["I1"],"severity":0.1,"valid_from":0,"valid_to":30}"#;
        assert!(decode_disruption(unknown).is_err());
    }
}

use log::{debug, info, warn};
use tokio::time::{interval, MissedTickBehavior};

use crate::communication::channel::{Address, Mailbox, MessageBus};
use crate::communication::messages::{DisruptionUpdate, Envelope, Payload};
use crate::flow_analyzer::predictive_model::DisruptionPredictor;
use crate::global_variables::{ADDR_DISRUPTION_FEED, TOPIC_DISRUPTIONS};
use crate::models::disruption::{DisruptionLedger, LedgerChange};
use crate::shared_data::{SimClock, Tick};

/// Polls a predictor and pushes what changed to the disruptions topic.
pub struct DisruptionFeed {
    predictor: Box<dyn DisruptionPredictor>,
    published: DisruptionLedger,
    available: bool,
}

impl DisruptionFeed {
    pub fn new(predictor: Box<dyn DisruptionPredictor>) -> Self {
        Self {
            predictor,
            published: DisruptionLedger::new(),
            available: true,
        }
    }

    /// Handles a message from another agent. Metric reports train the
    /// predictor. Another source announcing an outage makes consumers drop
    /// every event they hold, ours included, so the next poll sends them again.
    pub fn observe(&mut self, payload: &Payload) {
        match payload {
            Payload::MetricReport(report) => self.predictor.observe(report),
            Payload::DisruptionEvent(DisruptionUpdate::FeedUnavailable { reason }) => {
                if !self.published.is_empty() {
                    info!("Peer disruption source lost ({}); republishing on next poll", reason);
                    self.published.clear();
                }
            }
            _ => {}
        }
    }

    /// Updates to publish for this poll. An outage yields one
    /// `FeedUnavailable`; after recovery every active event is sent again
    /// because consumers dropped theirs.
    pub fn poll(&mut self, now: Tick) -> Vec<DisruptionUpdate> {
        self.published.prune(now);
        match self.predictor.predict(now) {
            Ok(events) => {
                if !self.available {
                    info!("Disruption predictor reachable again at tick {}", now);
                    self.available = true;
                }
                let mut updates = Vec::new();
                for event in events {
                    match self.published.apply(event.clone()) {
                        Ok(LedgerChange::Inserted | LedgerChange::Superseded) => {
                            updates.push(DisruptionUpdate::Event { event })
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Predictor produced an invalid event: {}", e),
                    }
                }
                updates
            }
            Err(e) => {
                if !self.available {
                    return Vec::new();
                }
                warn!("{}; consumers fall back to undisrupted weighting", e);
                self.available = false;
                self.published.clear();
                vec![DisruptionUpdate::FeedUnavailable {
                    reason: e.to_string(),
                }]
            }
        }
    }
}

/// Runs the feed as an agent. Metric reports and peer outages arriving on
/// `mailbox` go to [`DisruptionFeed::observe`]; every `period` ticks the
/// predictor is polled.
pub async fn run_disruption_feed(
    mut feed: DisruptionFeed,
    mut mailbox: Mailbox,
    bus: MessageBus,
    clock: SimClock,
    period: Tick,
) {
    let me = Address::new(ADDR_DISRUPTION_FEED);
    let mut ticker = interval(clock.span(period.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            envelope = mailbox.recv() => {
                let Some(envelope) = envelope else { break };
                if envelope.from != me {
                    feed.observe(&envelope.payload);
                }
            }
            _ = ticker.tick() => {
                let now = clock.now();
                for update in feed.poll(now) {
                    debug!("Publishing disruption update {:?}", update);
                    if let Err(e) = bus.send(Envelope::topic(
                        me.clone(),
                        TOPIC_DISRUPTIONS,
                        now,
                        Payload::DisruptionEvent(update),
                    )) {
                        warn!("Disruption update not delivered: {}", e);
                    }
                }
            }
        }
    }
    info!("Disruption feed stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_analyzer::predictive_model::ScriptedPredictor;
    use crate::models::disruption::{DisruptionEvent, DisruptionKind};

    fn incident() -> DisruptionEvent {
        DisruptionEvent {
            kind: DisruptionKind::Incident,
            area: vec!["I1".into()],
            severity: 0.9,
            valid_from: 0,
            valid_to: 100,
        }
    }

    #[test]
    fn publishes_each_event_once() {
        let mut feed = DisruptionFeed::new(Box::new(ScriptedPredictor::new(vec![incident()])));
        assert_eq!(feed.poll(1).len(), 1);
        assert!(feed.poll(2).is_empty());
    }

    #[test]
    fn outage_is_announced_once_and_recovery_republishes() {
        let predictor = ScriptedPredictor::new(vec![incident()]).with_outage(10, 20);
        let mut feed = DisruptionFeed::new(Box::new(predictor));
        feed.poll(1);
        assert!(matches!(
            feed.poll(10).as_slice(),
            [DisruptionUpdate::FeedUnavailable { .. }]
        ));
        assert!(feed.poll(11).is_empty());
        assert_eq!(
            feed.poll(20),
            vec![DisruptionUpdate::Event { event: incident() }]
        );
    }

    #[test]
    fn peer_outage_triggers_republish() {
        let mut feed = DisruptionFeed::new(Box::new(ScriptedPredictor::new(vec![incident()])));
        assert_eq!(feed.poll(0).len(), 1);
        feed.observe(&Payload::DisruptionEvent(DisruptionUpdate::FeedUnavailable {
            reason: "amqp down".into(),
        }));
        assert_eq!(
            feed.poll(5),
            vec![DisruptionUpdate::Event { event: incident() }]
        );
        assert!(feed.poll(10).is_empty());
    }

    #[test]
    fn peer_events_are_not_tracked() {
        let mut feed = DisruptionFeed::new(Box::new(ScriptedPredictor::default()));
        feed.observe(&Payload::DisruptionEvent(DisruptionUpdate::Event { event: incident() }));
        assert!(feed.poll(1).is_empty());
    }
}

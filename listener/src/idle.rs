use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::ContainerProperties;
use crate::events::ContainerEvent;
use crate::types::TopicPartition;

/// Tracks receipt times and produces idle / no-longer-idle events for the
/// container and for individual partitions. Pure state machine over injected
/// timestamps; the poll loop feeds it after every poll.
pub(crate) struct IdleTracker {
    started_at: Instant,
    last_receive: Instant,
    received_any: bool,
    container_idle: bool,
    last_container_event: Option<Instant>,
    partition_last_receive: HashMap<TopicPartition, Instant>,
    partition_idle: HashMap<TopicPartition, Option<Instant>>,
}

impl IdleTracker {
    pub fn new(now: Instant) -> Self {
        Self {
            started_at: now,
            last_receive: now,
            received_any: false,
            container_idle: false,
            last_container_event: None,
            partition_last_receive: HashMap::new(),
            partition_idle: HashMap::new(),
        }
    }

    pub fn on_assignment(&mut self, assigned: &[TopicPartition], now: Instant) {
        self.partition_last_receive
            .retain(|tp, _| assigned.contains(tp));
        self.partition_idle.retain(|tp, _| assigned.contains(tp));
        for tp in assigned {
            self.partition_last_receive.entry(tp.clone()).or_insert(now);
            self.partition_idle.entry(tp.clone()).or_insert(None);
        }
    }

    /// Record a poll outcome and return the events due for publication.
    pub fn on_poll(
        &mut self,
        props: &ContainerProperties,
        partitions_with_data: &[TopicPartition],
        now: Instant,
    ) -> Vec<ContainerEvent> {
        let mut events = Vec::new();

        if !partitions_with_data.is_empty() {
            self.received_any = true;
            self.last_receive = now;
            if self.container_idle {
                self.container_idle = false;
                self.last_container_event = None;
                events.push(ContainerEvent::NoLongerIdle);
            }
            for tp in partitions_with_data {
                self.partition_last_receive.insert(tp.clone(), now);
                if let Some(state) = self.partition_idle.get_mut(tp) {
                    if state.is_some() {
                        *state = None;
                        events.push(ContainerEvent::PartitionNoLongerIdle {
                            partition: tp.clone(),
                        });
                    }
                }
            }
        }

        if let Some(interval) = props.idle_event_interval {
            let threshold = if self.received_any {
                interval
            } else {
                // before the first record, stretch the interval by the
                // configured multiplier
                interval.mul_f64(props.idle_before_data_multiplier.max(1.0))
            };
            let reference = if self.received_any {
                self.last_receive
            } else {
                self.started_at
            };
            let idle_for = now.duration_since(reference);
            if idle_for >= threshold {
                let due = match self.last_container_event {
                    Some(last) => now.duration_since(last) >= threshold,
                    None => true,
                };
                if due {
                    self.container_idle = true;
                    self.last_container_event = Some(now);
                    events.push(ContainerEvent::Idle { idle_for });
                }
            }
        }

        if let Some(interval) = props.idle_partition_event_interval {
            for (tp, last) in &self.partition_last_receive {
                if partitions_with_data.contains(tp) {
                    continue;
                }
                let idle_for = now.duration_since(*last);
                if idle_for >= interval {
                    let state = self.partition_idle.entry(tp.clone()).or_insert(None);
                    let due = match state {
                        Some(last_event) => now.duration_since(*last_event) >= interval,
                        None => true,
                    };
                    if due {
                        *state = Some(now);
                        events.push(ContainerEvent::PartitionIdle {
                            partition: tp.clone(),
                            idle_for,
                        });
                    }
                }
            }
        }

        events
    }
}

/// How long the liveness monitor tolerates a silent poll loop.
pub(crate) fn non_responsive_threshold(props: &ContainerProperties) -> Duration {
    props.monitor_interval.mul_f64(props.no_poll_threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tp(p: i32) -> TopicPartition {
        TopicPartition::new("events", p)
    }

    fn props_with_idle(interval_ms: u64) -> ContainerProperties {
        let mut props = ContainerProperties::default();
        props.idle_event_interval = Some(Duration::from_millis(interval_ms));
        props.idle_before_data_multiplier = 1.0;
        props
    }

    #[test]
    fn idle_event_after_quiet_interval() {
        let start = Instant::now();
        let props = props_with_idle(100);
        let mut tracker = IdleTracker::new(start);

        let events = tracker.on_poll(&props, &[], start + Duration::from_millis(50));
        assert!(events.is_empty());

        let events = tracker.on_poll(&props, &[], start + Duration::from_millis(120));
        assert!(matches!(events.as_slice(), [ContainerEvent::Idle { .. }]));

        // not re-published until another interval elapses
        let events = tracker.on_poll(&props, &[], start + Duration::from_millis(150));
        assert!(events.is_empty());
        let events = tracker.on_poll(&props, &[], start + Duration::from_millis(230));
        assert!(matches!(events.as_slice(), [ContainerEvent::Idle { .. }]));
    }

    #[test]
    fn records_end_idleness() {
        let start = Instant::now();
        let props = props_with_idle(100);
        let mut tracker = IdleTracker::new(start);

        tracker.on_poll(&props, &[], start + Duration::from_millis(120));
        let events = tracker.on_poll(&props, &[tp(0)], start + Duration::from_millis(130));
        assert!(matches!(events.as_slice(), [ContainerEvent::NoLongerIdle]));
    }

    #[test]
    fn multiplier_stretches_first_idle() {
        let start = Instant::now();
        let mut props = props_with_idle(100);
        props.idle_before_data_multiplier = 3.0;
        let mut tracker = IdleTracker::new(start);

        let events = tracker.on_poll(&props, &[], start + Duration::from_millis(150));
        assert!(events.is_empty(), "first idle needs 3x the interval");
        let events = tracker.on_poll(&props, &[], start + Duration::from_millis(310));
        assert!(matches!(events.as_slice(), [ContainerEvent::Idle { .. }]));
    }

    #[test]
    fn partition_idle_is_per_partition() {
        let start = Instant::now();
        let mut props = ContainerProperties::default();
        props.idle_partition_event_interval = Some(Duration::from_millis(100));
        let mut tracker = IdleTracker::new(start);
        tracker.on_assignment(&[tp(0), tp(1)], start);

        // tp(0) keeps receiving; tp(1) goes quiet
        tracker.on_poll(&props, &[tp(0), tp(1)], start + Duration::from_millis(10));
        let events = tracker.on_poll(&props, &[tp(0)], start + Duration::from_millis(130));
        assert!(
            matches!(events.as_slice(), [ContainerEvent::PartitionIdle { partition, .. }] if *partition == tp(1))
        );

        let events = tracker.on_poll(&props, &[tp(0), tp(1)], start + Duration::from_millis(140));
        assert!(
            matches!(events.as_slice(), [ContainerEvent::PartitionNoLongerIdle { partition }] if *partition == tp(1))
        );
    }

    #[test]
    fn threshold_scales_with_monitor_interval() {
        let mut props = ContainerProperties::default();
        props.monitor_interval = Duration::from_secs(10);
        props.no_poll_threshold = 3.0;
        assert_eq!(non_responsive_threshold(&props), Duration::from_secs(30));
    }
}

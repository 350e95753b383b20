//! Bounded in-memory event history

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::TriageEvent;

/// Ring buffer of the most recent events
pub struct EventHistory {
    capacity: usize,
    events: Mutex<VecDeque<TriageEvent>>,
}

impl EventHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
        }
    }

    pub(crate) fn record(&self, event: &TriageEvent) {
        let mut events = self.events.lock().unwrap_or_else(|p| p.into_inner());
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event.clone());
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events in `[start, end]`, oldest first
    pub fn get_events(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<TriageEvent> {
        self.filtered(|e| e.timestamp() >= start && e.timestamp() <= end)
    }

    /// Retained events about one issue, oldest first
    pub fn get_issue_events(&self, issue_id: &str) -> Vec<TriageEvent> {
        self.filtered(|e| e.issue_id() == issue_id)
    }

    fn filtered(&self, keep: impl Fn(&TriageEvent) -> bool) -> Vec<TriageEvent> {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|e| keep(e))
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> EventStats {
        let events = self.events.lock().unwrap_or_else(|p| p.into_inner());
        EventStats::from_events(events.iter())
    }
}

/// Counts by event type over the retained window
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventStats {
    pub total: usize,
    pub by_type: HashMap<String, usize>,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
}

impl EventStats {
    pub fn from_events<'a>(events: impl Iterator<Item = &'a TriageEvent>) -> Self {
        let mut stats = Self::default();
        for event in events {
            stats.total += 1;
            *stats.by_type.entry(event.event_type().to_string()).or_insert(0) += 1;
            let ts = event.timestamp();
            stats.first = Some(stats.first.map_or(ts, |f| f.min(ts)));
            stats.last = Some(stats.last.map_or(ts, |l| l.max(ts)));
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn closed(id: &str, at: DateTime<Utc>) -> TriageEvent {
        TriageEvent::IssueClosed {
            issue_id: id.to_string(),
            timestamp: at,
        }
    }

    #[test]
    fn test_ring_drops_oldest() {
        let history = EventHistory::new(2);
        let now = Utc::now();
        history.record(&closed("a", now));
        history.record(&closed("b", now));
        history.record(&closed("c", now));
        assert_eq!(history.len(), 2);
        assert!(history.get_issue_events("a").is_empty());
        assert_eq!(history.get_issue_events("c").len(), 1);
    }

    #[test]
    fn test_time_range_and_stats() {
        let history = EventHistory::new(10);
        let now = Utc::now();
        history.record(&closed("a", now - Duration::hours(2)));
        history.record(&closed("b", now));

        assert_eq!(history.get_events(now - Duration::hours(1), now).len(), 1);
        let stats = history.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_type["issue_closed"], 2);
        assert_eq!(stats.last, Some(now));
    }
}

use std::sync::Arc;

use stratum_model::Labels;
use tokio::sync::mpsc;

use crate::api::EventSink;
use crate::watch::Watcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEventKind {
    ReturnedElements,
    Error,
    AddedWatcher,
    ExistingWatcher,
    RemovedWatcher,
}

#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub kind: TraceEventKind,
    pub namespace_id: u64,
    pub version: u32,
    pub labels: Labels,
    pub document: String,
    pub flavor: Option<String>,
    /// Who caused the event: the watcher uid, or 0 for plain requests.
    pub peer: u32,
}

/// Which events a subscription wants. Every set field must equal (document,
/// flavor) or be contained in (labels) the event's corresponding field; an
/// empty selector traces the whole namespace.
#[derive(Debug, Clone, Default)]
pub struct TraceSelector {
    pub labels: Option<Labels>,
    pub document: Option<String>,
    pub flavor: Option<String>,
}

impl TraceSelector {
    pub fn matches(&self, event: &TraceEvent) -> bool {
        if let Some(labels) = &self.labels {
            if !event.labels.contains(labels) {
                return false;
            }
        }
        if let Some(document) = &self.document {
            if event.document != *document {
                return false;
            }
        }
        if let Some(flavor) = &self.flavor {
            if event.flavor.as_deref() != Some(flavor.as_str()) {
                return false;
            }
        }
        true
    }
}

pub struct TraceSubscription {
    pub selector: TraceSelector,
    sink: Box<dyn EventSink<TraceEvent>>,
}

impl TraceSubscription {
    pub fn new(selector: TraceSelector, sink: Box<dyn EventSink<TraceEvent>>) -> TraceSubscription {
        TraceSubscription { selector, sink }
    }

    pub fn offer(&self, event: &TraceEvent) -> bool {
        if self.selector.matches(event) {
            return self.sink.deliver(event.clone());
        }
        true
    }
}

/// The subscriber half: holds the only strong reference, so dropping it ends
/// the subscription; the next dead-pointer pass sweeps the weak entry.
pub struct TraceHandle {
    pub subscription: Arc<TraceSubscription>,
    pub events: mpsc::UnboundedReceiver<TraceEvent>,
}

pub fn watcher_event(kind: TraceEventKind, namespace_id: u64, version: u32, w: &Watcher) -> TraceEvent {
    TraceEvent {
        kind,
        namespace_id,
        version,
        labels: w.labels.clone(),
        document: w.document.clone(),
        flavor: w.flavors.first().cloned(),
        peer: w.uid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_model::labels;

    fn event(labels: Labels, document: &str, flavor: Option<&str>) -> TraceEvent {
        TraceEvent {
            kind: TraceEventKind::ReturnedElements,
            namespace_id: 1,
            version: 1,
            labels,
            document: document.to_string(),
            flavor: flavor.map(str::to_string),
            peer: 0,
        }
    }

    #[test]
    fn empty_selector_matches_everything() {
        let selector = TraceSelector::default();
        assert!(selector.matches(&event(labels! {"env" => "prod"}, "db", None)));
        assert!(selector.matches(&event(Labels::empty(), "other", Some("cache"))));
    }

    #[test]
    fn selector_fields_constrain_events() {
        let selector = TraceSelector {
            labels: Some(labels! {"env" => "prod"}),
            document: Some("db".to_string()),
            flavor: None,
        };
        assert!(selector.matches(&event(labels! {"env" => "prod", "region" => "eu"}, "db", None)));
        assert!(!selector.matches(&event(labels! {"env" => "dev"}, "db", None)));
        assert!(!selector.matches(&event(labels! {"env" => "prod"}, "other", None)));

        let flavored = TraceSelector {
            flavor: Some("cache".to_string()),
            ..TraceSelector::default()
        };
        assert!(flavored.matches(&event(Labels::empty(), "db", Some("cache"))));
        assert!(!flavored.matches(&event(Labels::empty(), "db", None)));
    }
}

//! Routing rules: which sinks receive which events.

use std::collections::BTreeSet;

use crate::detect::{Event, EventType, Severity};

/// Event types a rule matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventTypeFilter {
    /// `*`: every type.
    Any,
    /// Only the listed types.
    Only(BTreeSet<EventType>),
}

impl EventTypeFilter {
    /// Returns true if `event_type` passes the filter.
    #[must_use]
    pub fn matches(&self, event_type: EventType) -> bool {
        match self {
            Self::Any => true,
            Self::Only(types) => types.contains(&event_type),
        }
    }
}

/// Maps event type and severity to an ordered list of sink names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingRule {
    /// Types this rule applies to.
    pub event_types: EventTypeFilter,
    /// Severities this rule applies to; empty means all.
    pub severities: BTreeSet<Severity>,
    /// Destination sinks, in order.
    pub sinks: Vec<String>,
}

impl RoutingRule {
    /// A rule matching every event.
    #[must_use]
    pub fn catch_all(sinks: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            event_types: EventTypeFilter::Any,
            severities: BTreeSet::new(),
            sinks: sinks.into_iter().map(Into::into).collect(),
        }
    }

    /// A rule matching only the given types.
    #[must_use]
    pub fn for_types(
        types: impl IntoIterator<Item = EventType>,
        sinks: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            event_types: EventTypeFilter::Only(types.into_iter().collect()),
            severities: BTreeSet::new(),
            sinks: sinks.into_iter().map(Into::into).collect(),
        }
    }

    /// Restricts the rule to the given severities.
    #[must_use]
    pub fn with_severities(mut self, severities: impl IntoIterator<Item = Severity>) -> Self {
        self.severities = severities.into_iter().collect();
        self
    }

    /// Returns true if the rule applies to `event`.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        self.event_types.matches(event.event_type)
            && (self.severities.is_empty() || self.severities.contains(&event.severity))
    }
}

/// Evaluates rules in configured order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Router {
    rules: Vec<RoutingRule>,
}

impl Router {
    /// Creates a router over `rules`.
    #[must_use]
    pub const fn new(rules: Vec<RoutingRule>) -> Self {
        Self { rules }
    }

    /// Returns the configured rules.
    #[must_use]
    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    /// Sinks for `event`: the union over every matching rule, first-seen order.
    ///
    /// An empty result means the event is not routed anywhere.
    #[must_use]
    pub fn route(&self, event: &Event) -> Vec<&str> {
        let mut sinks: Vec<&str> = Vec::new();
        for rule in self.rules.iter().filter(|r| r.matches(event)) {
            for sink in &rule.sinks {
                if !sinks.contains(&sink.as_str()) {
                    sinks.push(sink);
                }
            }
        }
        sinks
    }
}

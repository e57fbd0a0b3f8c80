//! Topics and event payloads carried on the bus

use crate::models::Instance;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Closed set of topics handlers can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    MetricsCollected,
    EmissionsCalculated,
}

impl Topic {
    pub const ALL: [Topic; 2] = [Topic::MetricsCollected, Topic::EmissionsCalculated];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::MetricsCollected => "metrics_collected",
            Topic::EmissionsCalculated => "emissions_calculated",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Utilization samples for one instance were collected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsCollected {
    pub instance: Instance,
    /// Sampling interval the metrics cover
    pub interval: Duration,
}

/// An instance has been annotated with its emissions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmissionsCalculated {
    pub instance: Instance,
    pub interval: Duration,
}

/// Envelope flowing through the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    MetricsCollected(MetricsCollected),
    EmissionsCalculated(EmissionsCalculated),
}

impl Event {
    pub fn metrics_collected(instance: Instance, interval: Duration) -> Self {
        Event::MetricsCollected(MetricsCollected { instance, interval })
    }

    pub fn emissions_calculated(instance: Instance, interval: Duration) -> Self {
        Event::EmissionsCalculated(EmissionsCalculated { instance, interval })
    }

    pub fn topic(&self) -> Topic {
        match self {
            Event::MetricsCollected(_) => Topic::MetricsCollected,
            Event::EmissionsCalculated(_) => Topic::EmissionsCalculated,
        }
    }

    /// The instance the event is about
    pub fn instance(&self) -> &Instance {
        match self {
            Event::MetricsCollected(e) => &e.instance,
            Event::EmissionsCalculated(e) => &e.instance,
        }
    }
}

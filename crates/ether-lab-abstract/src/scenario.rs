use crate::config::{LinkDetail, SimConfig};
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
pub struct TestScenario {
    pub name: String,
    pub description: String,
    pub config: SimConfigOverride,
    pub bus: BusSpec,
    pub actions: Vec<TestAction>,
    pub assertions: Vec<TestAssertion>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct SimConfigOverride {
    pub seed: Option<u64>,
    pub rx_own_broadcast: Option<bool>,
    pub queue_limit: Option<usize>,
}

impl SimConfigOverride {
    pub fn apply_to(&self, config: &mut SimConfig) {
        if let Some(v) = self.seed {
            config.seed = v;
        }
        if let Some(v) = self.rx_own_broadcast {
            config.rx_own_broadcast = v;
        }
        if let Some(v) = self.queue_limit {
            config.queue_limit = Some(v);
        }
    }
}

/// One shared bus with `nodes` taps attached in order.
#[derive(Deserialize, Debug, Clone)]
pub struct BusSpec {
    pub nodes: u32,
    pub bandwidth_bps: f64,
    #[serde(default)]
    pub detail: LinkDetail,
    /// Metres between adjacent taps; meaningful on full-detail buses only.
    #[serde(default)]
    pub spacing_m: Option<f64>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestAction {
    /// A node hands a frame of `size` bytes to its interface at `time`.
    Send { time: f64, from: u32, to: u32, size: u32 },
    /// As `Send`, addressed to the broadcast MAC.
    Broadcast { time: f64, from: u32, size: u32 },
    /// Mark a node down before the run starts.
    NodeDown { node: u32 },
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestAssertion {
    /// Node `node` received exactly `count` frames.
    Delivered { node: u32, count: u32 },
    /// The trace contains between `min` and `max` occurrences of `code`.
    TraceCount { code: String, min: u32, max: Option<u32> },
    /// The run finishes within `secs` of simulation time.
    MaxDuration { secs: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_patches_only_set_fields() {
        let mut config = SimConfig::default();
        let patch = SimConfigOverride {
            seed: Some(42),
            ..Default::default()
        };
        patch.apply_to(&mut config);
        assert_eq!(config.seed, 42);
        assert!(!config.rx_own_broadcast);
        assert!(config.queue_limit.is_none());
    }
}

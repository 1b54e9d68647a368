use serde::{Deserialize, Deserializer, Serialize};

/// Run-wide knobs. Per-bus parameters (bandwidth, detail) live on the link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Base seed; each interface derives its own RNG stream from this.
    pub seed: u64,
    /// Whether a broadcast sender hears its own frame.
    pub rx_own_broadcast: bool,
    /// Bound on each interface's transmit queue. `None` means unbounded.
    pub queue_limit: Option<usize>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            rx_own_broadcast: false,
            queue_limit: None,
        }
    }
}

/// How much of the physical layer a bus models. `Full` adds finite signal
/// propagation between tap positions; `Partial` and `None` sense instantly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LinkDetail {
    None,
    #[default]
    Partial,
    Full,
}

impl LinkDetail {
    /// Historical configs carry misspellings of "partial"; anything that is
    /// not exactly `none` or `full` reads as `Partial`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "none" => LinkDetail::None,
            "full" => LinkDetail::Full,
            _ => LinkDetail::Partial,
        }
    }
}

impl<'de> Deserialize<'de> for LinkDetail {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(LinkDetail::from_name(&name))
    }
}

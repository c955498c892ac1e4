use std::collections::HashMap;

use super::entry::{EntryStatus, PRIORITY_IMPORTANT, QueueEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BandwidthMode {
    #[default]
    Auto,
    ConstrainedOnly,
    WifiOnly,
    Unrestricted,
}

impl BandwidthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BandwidthMode::Auto => "auto",
            BandwidthMode::ConstrainedOnly => "constrained",
            BandwidthMode::WifiOnly => "wifi-only",
            BandwidthMode::Unrestricted => "unrestricted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(BandwidthMode::Auto),
            "constrained" | "constrained-only" | "constrained_only" => {
                Some(BandwidthMode::ConstrainedOnly)
            }
            "wifi" | "wifi-only" | "wifi_only" => Some(BandwidthMode::WifiOnly),
            "unrestricted" => Some(BandwidthMode::Unrestricted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkType {
    Wifi,
    Ethernet,
    Cellular,
    Offline,
    #[default]
    Unknown,
}

impl NetworkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkType::Wifi => "wifi",
            NetworkType::Ethernet => "ethernet",
            NetworkType::Cellular => "cellular",
            NetworkType::Offline => "offline",
            NetworkType::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "wifi" => Some(NetworkType::Wifi),
            "ethernet" => Some(NetworkType::Ethernet),
            "cellular" | "mobile" => Some(NetworkType::Cellular),
            "offline" | "none" => Some(NetworkType::Offline),
            "unknown" => Some(NetworkType::Unknown),
            _ => None,
        }
    }

    pub fn is_online(&self) -> bool {
        !matches!(self, NetworkType::Offline)
    }
}

/// Knobs for one sync pass. Built per pass, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncPolicy {
    pub bandwidth_mode: BandwidthMode,
    pub max_batch_size: usize,
    pub max_entries_per_pass: usize,
    /// How many ready rows are read from the store per planning round.
    pub candidate_window: usize,
    /// Replaces the stored priority for a kind tag, e.g. `"device_status" => 2`.
    pub priority_overrides: HashMap<String, i64>,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            bandwidth_mode: BandwidthMode::Auto,
            max_batch_size: 10,
            max_entries_per_pass: 100,
            candidate_window: 500,
            priority_overrides: HashMap::new(),
        }
    }
}

impl SyncPolicy {
    pub fn effective_priority(&self, entry: &QueueEntry) -> i64 {
        self.priority_overrides
            .get(entry.entity_kind.as_str().as_ref())
            .copied()
            .unwrap_or(entry.priority)
    }

    fn allows(&self, priority: i64, network: NetworkType) -> bool {
        match (self.bandwidth_mode, network) {
            (_, NetworkType::Offline) => false,
            (BandwidthMode::Unrestricted, _) => true,
            (BandwidthMode::ConstrainedOnly, _) => priority <= PRIORITY_IMPORTANT,
            (BandwidthMode::Auto, NetworkType::Cellular) => priority <= PRIORITY_IMPORTANT,
            (BandwidthMode::Auto, _) => true,
            (BandwidthMode::WifiOnly, NetworkType::Cellular) => false,
            (BandwidthMode::WifiOnly, _) => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchPlan {
    pub selected: Vec<QueueEntry>,
    /// Pending entries held back by the bandwidth policy.
    pub deferred: usize,
}

impl BatchPlan {
    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }
}

/// Picks the next batch from `candidates`.
///
/// Ranking is (effective priority, created_at, id). Entries that are not
/// PENDING are skipped, so nothing already in flight is dispatched twice.
pub fn select_batch(
    candidates: &[QueueEntry],
    policy: &SyncPolicy,
    network: NetworkType,
) -> BatchPlan {
    let mut ranked: Vec<(i64, &QueueEntry)> = Vec::new();
    let mut deferred = 0;
    for entry in candidates
        .iter()
        .filter(|entry| entry.status == EntryStatus::Pending)
    {
        let priority = policy.effective_priority(entry);
        if policy.allows(priority, network) {
            ranked.push((priority, entry));
        } else {
            deferred += 1;
        }
    }
    ranked.sort_by_key(|(priority, entry)| (*priority, entry.created_at, entry.id));
    ranked.truncate(policy.max_batch_size);

    BatchPlan {
        selected: ranked.into_iter().map(|(_, entry)| entry.clone()).collect(),
        deferred,
    }
}

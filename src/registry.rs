//! Deduplicating registry of devices seen during one discovery session.

use std::time::{Duration, Instant};

use tracing::trace;

use crate::device::{AddressableDevice, Connectable, ScanCandidate};

/// Minimum time between metadata refreshes of an already known entry.
pub const DEFAULT_REANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct Entry {
    device: AddressableDevice,
    refreshed_at: Instant,
}

/// Insertion-ordered, append-only collection of discovered devices.
///
/// No two entries share `(display_name, address)`.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    entries: Vec<Entry>,
    reannounce_interval: Duration,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::with_reannounce_interval(DEFAULT_REANNOUNCE_INTERVAL)
    }

    /// Create an empty registry with a custom refresh throttle.
    pub fn with_reannounce_interval(interval: Duration) -> Self {
        Self {
            entries: Vec::new(),
            reannounce_interval: interval,
        }
    }

    /// Forget every device. Called when a discovery session starts.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Add a candidate unless it is nameless, non-connectable or already known.
    ///
    /// Returns `true` only when a new entry was appended; the caller then
    /// announces it. A repeated advertisement of a known entry may refresh
    /// its signal strength (at most once per re-announce interval) but
    /// always returns `false`.
    pub fn add_if_new(&mut self, candidate: &ScanCandidate) -> bool {
        if candidate.connectable == Connectable::No {
            trace!("Ignoring non-connectable device {}", candidate.address);
            return false;
        }

        let Some(device) = candidate.to_device() else {
            trace!("Ignoring nameless device {}", candidate.address);
            return false;
        };

        let now = Instant::now();

        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.device == device)
        {
            if now.duration_since(entry.refreshed_at) >= self.reannounce_interval {
                entry.device = device;
                entry.refreshed_at = now;
            }
            return false;
        }

        self.entries.push(Entry {
            device,
            refreshed_at: now,
        });
        true
    }

    /// Devices in discovery order.
    pub fn devices(&self) -> Vec<AddressableDevice> {
        self.entries.iter().map(|e| e.device.clone()).collect()
    }

    /// The most recently appended device.
    pub fn last(&self) -> Option<&AddressableDevice> {
        self.entries.last().map(|e| &e.device)
    }

    /// Look up an entry by address.
    pub fn find_by_address(&self, address: &str) -> Option<&AddressableDevice> {
        self.entries
            .iter()
            .map(|e| &e.device)
            .find(|d| d.address() == address)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

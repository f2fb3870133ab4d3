use std::collections::HashMap;
use std::sync::RwLock;

use haven_types::host_id::HostId;

use crate::store::FileEntry;

/// Host-availability view: `host -> flag`, keyed by host public key.
pub type HostMap = HashMap<HostId, bool>;

/// The two host maps the health model consumes. `offline[h]` is true when
/// the host is currently unreachable; `good_for_renew[h]` is true when the
/// host is acceptable for contract renewal.
#[derive(Debug, Clone, Default)]
pub struct HostUtilities {
    pub offline: HostMap,
    pub good_for_renew: HostMap,
}

/// Per-host utility flags tracked by the contract subsystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostUtility {
    pub offline: bool,
    pub good_for_renew: bool,
}

/// Source of the host-availability view used during health calculation.
pub trait HostCatalog: Send + Sync {
    /// Snapshot the offline and good-for-renew maps for the hosts relevant
    /// to `entries`. Implementations may return a superset; the health
    /// model treats absent hosts as unusable.
    fn contracts_and_utilities(&self, entries: &[&dyn FileEntry]) -> HostUtilities;
}

/// In-memory host catalog fed by the contract subsystem as it scores hosts.
#[derive(Debug, Default)]
pub struct UtilityTable {
    hosts: RwLock<HashMap<HostId, HostUtility>>,
}

impl UtilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_utility(&self, host: HostId, utility: HostUtility) {
        let mut hosts = self.hosts.write().unwrap();
        hosts.insert(host, utility);
    }

    /// Forget a host, e.g. after its contract expires.
    pub fn remove_host(&self, host: &HostId) {
        let mut hosts = self.hosts.write().unwrap();
        hosts.remove(host);
    }

    pub fn utility(&self, host: &HostId) -> Option<HostUtility> {
        let hosts = self.hosts.read().unwrap();
        hosts.get(host).copied()
    }
}

impl HostCatalog for UtilityTable {
    fn contracts_and_utilities(&self, _entries: &[&dyn FileEntry]) -> HostUtilities {
        let hosts = self.hosts.read().unwrap();
        let mut utilities = HostUtilities::default();
        for (host, utility) in hosts.iter() {
            utilities.offline.insert(*host, utility.offline);
            utilities
                .good_for_renew
                .insert(*host, utility.good_for_renew);
        }
        utilities
    }
}

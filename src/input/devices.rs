//! Registry of devices currently joined to the network.

use crate::error::Result;
use crate::state::DeviceRegistry;
use log::info;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashSet;

#[derive(Deserialize)]
struct DeviceEntry {
    ieee_address: String,
}

/// Parse a device list message into IEEE addresses.
pub fn parse_device_list(payload: &str) -> Result<Vec<String>> {
    let entries: Vec<DeviceEntry> = serde_json::from_str(payload)?;
    Ok(entries.into_iter().map(|e| e.ieee_address).collect())
}

/// Known device ids, filled from the device list.
///
/// Until the first list arrives every device counts as live, so a bridge
/// that never learned the network does not prune its cache.
#[derive(Default)]
pub struct KnownDevices {
    ids: RwLock<Option<HashSet<String>>>,
}

impl KnownDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, ids: impl IntoIterator<Item = String>) {
        let ids: HashSet<String> = ids.into_iter().collect();
        info!("[Bridge] {} devices on the network", ids.len());
        *self.ids.write() = Some(ids);
    }

    pub fn forget(&self, id: &str) {
        if let Some(ids) = self.ids.write().as_mut() {
            ids.remove(id);
        }
    }
}

impl DeviceRegistry for KnownDevices {
    fn is_live(&self, entity: &str) -> bool {
        match &*self.ids.read() {
            Some(ids) => ids.contains(entity),
            None => true,
        }
    }
}

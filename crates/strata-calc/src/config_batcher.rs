//! Configuration batcher
//!
//! Collects global and per-host parameters while the datastore snapshot
//! loads and forwards them once, at in-sync. After that every change is
//! forwarded at the next flush.

use std::collections::BTreeMap;

use strata_common::model::ConfigKey;
use strata_common::Result;
use tracing::debug;

/// Receives batched configuration
pub trait ConfigBatcherCallbacks {
    /// The raw global or per-host parameters changed
    fn on_config_update(
        &mut self,
        global: &BTreeMap<String, String>,
        host: &BTreeMap<String, String>,
    ) -> Result<()>;
}

/// Buffers configuration updates for the local node
#[derive(Debug)]
pub struct ConfigBatcher {
    hostname: String,
    global: BTreeMap<String, String>,
    host: BTreeMap<String, String>,
    dirty: bool,
    in_sync: bool,
}

impl ConfigBatcher {
    /// Create a batcher for the node named `hostname`
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            global: BTreeMap::new(),
            host: BTreeMap::new(),
            dirty: true,
            in_sync: false,
        }
    }

    /// Record one parameter update; other nodes' parameters are ignored
    pub fn on_config_update(&mut self, key: &ConfigKey, value: Option<&str>) {
        let (map, name) = match key {
            ConfigKey::Global { name } => (&mut self.global, name),
            ConfigKey::Host { hostname, name } if *hostname == self.hostname => {
                (&mut self.host, name)
            }
            ConfigKey::Host { .. } => return,
        };
        let changed = match value {
            Some(value) => map.insert(name.clone(), value.to_string()).as_deref() != Some(value),
            None => map.remove(name).is_some(),
        };
        if changed {
            debug!(param = %name, "config parameter changed");
            self.dirty = true;
        }
    }

    /// The datastore delivered its complete snapshot
    pub fn on_datastore_in_sync(&mut self) {
        self.in_sync = true;
    }

    /// Forward the parameters if they changed since the last flush
    pub fn flush<C: ConfigBatcherCallbacks + ?Sized>(&mut self, cb: &mut C) -> Result<()> {
        if !self.in_sync || !self.dirty {
            return Ok(());
        }
        cb.on_config_update(&self.global, &self.host)?;
        self.dirty = false;
        Ok(())
    }
}

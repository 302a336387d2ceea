//! Device registry
//!
//! Maps device ids to whatever a management layer needs per device, usually
//! a [`NodeHandle`]. The registry is an ordinary value: create one where the
//! devices are brought up and pass it to whoever needs to look them up.
//!
//! [`NodeHandle`]: ../node/struct.NodeHandle.html

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Error;

/// Identifies one radio device
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct DeviceId(pub u16);

/// Entries keyed by device id, iterated in id order
#[derive(Debug)]
pub struct Registry<T> {
    entries: BTreeMap<DeviceId, T>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Registry {
            entries: BTreeMap::new(),
        }
    }
}

impl<T> Registry<T> {
    /// Creates an empty registry
    pub fn new() -> Self {
        Registry::default()
    }

    /// Adds the entry for `id`
    ///
    /// Fails with `InvalidArgument` if `id` is already registered.
    pub fn register(&mut self, id: DeviceId, entry: T) -> Result<(), Error> {
        if self.entries.contains_key(&id) {
            return Err(Error::InvalidArgument);
        }
        debug!(device = id.0, "device registered");
        self.entries.insert(id, entry);
        Ok(())
    }

    /// Removes and returns the entry for `id`
    pub fn unregister(&mut self, id: DeviceId) -> Result<T, Error> {
        let entry = self.entries.remove(&id).ok_or(Error::NotFound)?;
        debug!(device = id.0, "device unregistered");
        Ok(entry)
    }

    /// The entry for `id`
    pub fn get(&self, id: DeviceId) -> Option<&T> {
        self.entries.get(&id)
    }

    /// Mutable access to the entry for `id`
    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut T> {
        self.entries.get_mut(&id)
    }

    /// Registered ids in ascending order
    pub fn ids(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.entries.keys().copied()
    }

    /// All entries in id order
    pub fn iter(&self) -> impl Iterator<Item = (DeviceId, &T)> {
        self.entries.iter().map(|(id, entry)| (*id, entry))
    }

    /// Number of registered devices
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no device is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let mut registry = Registry::new();
        registry.register(DeviceId(1), "uwb1").unwrap();
        registry.register(DeviceId(0), "uwb0").unwrap();

        assert_eq!(registry.get(DeviceId(1)), Some(&"uwb1"));
        assert_eq!(registry.get(DeviceId(2)), None);
        assert_eq!(registry.ids().collect::<Vec<_>>(), vec![DeviceId(0), DeviceId(1)]);
    }

    #[test]
    fn ids_are_unique() {
        let mut registry = Registry::new();
        registry.register(DeviceId(3), 1).unwrap();

        assert!(matches!(
            registry.register(DeviceId(3), 2),
            Err(Error::InvalidArgument)
        ));
        assert_eq!(registry.get(DeviceId(3)), Some(&1));
    }

    #[test]
    fn unregister() {
        let mut registry = Registry::new();
        registry.register(DeviceId(3), 1).unwrap();

        assert_eq!(registry.unregister(DeviceId(3)).unwrap(), 1);
        assert!(registry.is_empty());
        assert!(matches!(registry.unregister(DeviceId(3)), Err(Error::NotFound)));
    }
}

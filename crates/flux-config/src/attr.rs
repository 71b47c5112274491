//! The broker attribute store: a flat key/value table with per-key
//! mutability flags, read by every service handler that needs to look up
//! `rank`, `size`, `tbon.*`, or `broker.*` without threading a typed config
//! struct through every call site.

use std::collections::BTreeMap;

use bitflags::bitflags;

use crate::ConfigError;

bitflags! {
    /// Mutability flags attached to an attribute entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AttrFlags: u8 {
        /// Set once at creation and never again, by anyone.
        const IMMUTABLE = 0x01;
        /// Visible but only the broker itself may change it.
        const READONLY  = 0x02;
        const RUNTIME   = 0x04;
        const CONFIG    = 0x08;
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    flags: AttrFlags,
}

/// Flat attribute table. Values are always strings on the wire; callers
/// parse ints/bools themselves the way `rank`/`size`/`tbon.fanout` do.
#[derive(Debug, Clone, Default)]
pub struct AttrStore {
    entries: BTreeMap<String, Entry>,
}

impl AttrStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new attribute. Errors if the name is already registered.
    pub fn add(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
        flags: AttrFlags,
    ) -> Result<(), ConfigError> {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(ConfigError::AttrExists(name));
        }
        self.entries.insert(
            name,
            Entry {
                value: value.into(),
                flags,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<(&str, AttrFlags)> {
        self.entries.get(name).map(|e| (e.value.as_str(), e.flags))
    }

    /// Set an existing attribute's value, honoring IMMUTABLE/READONLY.
    /// `force` bypasses both, for the broker's own derived-attribute writes
    /// (`tbon.endpoint`, `tbon.level`, ...).
    pub fn set(&mut self, name: &str, value: impl Into<String>, force: bool) -> Result<(), ConfigError> {
        let entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| ConfigError::AttrUnknown(name.to_string()))?;
        if !force {
            if entry.flags.contains(AttrFlags::IMMUTABLE) {
                return Err(ConfigError::AttrImmutable(name.to_string()));
            }
            if entry.flags.contains(AttrFlags::READONLY) {
                return Err(ConfigError::AttrReadonly(name.to_string()));
            }
        }
        entry.value = value.into();
        Ok(())
    }

    /// Delete an attribute. IMMUTABLE attributes require `force`.
    pub fn delete(&mut self, name: &str, force: bool) -> Result<(), ConfigError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| ConfigError::AttrUnknown(name.to_string()))?;
        if entry.flags.contains(AttrFlags::IMMUTABLE) && !force {
            return Err(ConfigError::AttrImmutable(name.to_string()));
        }
        self.entries.remove(name);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, AttrFlags)> {
        self.entries
            .iter()
            .map(|(k, e)| (k.as_str(), e.value.as_str(), e.flags))
    }
}

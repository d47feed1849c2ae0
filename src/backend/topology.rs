//! Replication Topology
//!
//! A plugin's metro and replica remotes are stored as backend names plus a
//! weak handle to the backend table. They are set once after both sides are
//! registered and resolved on every call, so a deregistered remote reads as
//! unusable rather than dangling.

use crate::domain::{BackendLookup, BackendPlugin};
use crate::error::{Error, Result};
use std::sync::{Arc, OnceLock, Weak};

#[derive(Default)]
pub struct Topology {
    lookup: OnceLock<Weak<dyn BackendLookup>>,
    metro_remote: OnceLock<String>,
    replica_remote: OnceLock<String>,
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology")
            .field("metro_remote", &self.metro_remote.get())
            .field("replica_remote", &self.replica_remote.get())
            .finish()
    }
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    fn check(slot: &OnceLock<String>, owner: &str, remote: &str) -> Result<()> {
        if remote == owner {
            return Err(Error::Configuration(format!(
                "backend {} can't be bonded to itself",
                owner
            )));
        }
        match slot.get() {
            Some(bonded) if bonded != remote => Err(Error::AlreadyBonded {
                backend: owner.to_string(),
                existing: bonded.clone(),
            }),
            _ => Ok(()),
        }
    }

    fn bond(
        slot: &OnceLock<String>,
        lookup_slot: &OnceLock<Weak<dyn BackendLookup>>,
        owner: &str,
        lookup: Weak<dyn BackendLookup>,
        remote: &str,
    ) -> Result<()> {
        Self::check(slot, owner, remote)?;
        let bonded = slot.get_or_init(|| remote.to_string());
        if bonded != remote {
            return Err(Error::AlreadyBonded {
                backend: owner.to_string(),
                existing: bonded.clone(),
            });
        }
        let _ = lookup_slot.set(lookup);
        Ok(())
    }

    /// Whether `remote` could be bonded as the metro remote, without bonding it
    pub fn check_metro(&self, owner: &str, remote: &str) -> Result<()> {
        Self::check(&self.metro_remote, owner, remote)
    }

    pub fn check_replica(&self, owner: &str, remote: &str) -> Result<()> {
        Self::check(&self.replica_remote, owner, remote)
    }

    /// Bond the metro remote; rebonding the same name is a no-op
    pub fn bond_metro(&self, owner: &str, lookup: Weak<dyn BackendLookup>, remote: &str) -> Result<()> {
        Self::bond(&self.metro_remote, &self.lookup, owner, lookup, remote)
    }

    /// Bond the replica remote; rebonding the same name is a no-op
    pub fn bond_replica(
        &self,
        owner: &str,
        lookup: Weak<dyn BackendLookup>,
        remote: &str,
    ) -> Result<()> {
        Self::bond(&self.replica_remote, &self.lookup, owner, lookup, remote)
    }

    fn resolve(&self, name: Option<&String>) -> Option<Arc<dyn BackendPlugin>> {
        let name = name?;
        let lookup = self.lookup.get()?.upgrade()?;
        lookup.lookup(name)
    }

    pub fn metro_remote_name(&self) -> Option<&str> {
        self.metro_remote.get().map(String::as_str)
    }

    pub fn replica_remote_name(&self) -> Option<&str> {
        self.replica_remote.get().map(String::as_str)
    }

    /// Metro remote plugin, if bonded and still registered
    pub fn metro_remote(&self) -> Option<Arc<dyn BackendPlugin>> {
        self.resolve(self.metro_remote.get())
    }

    /// Replica remote plugin, if bonded and still registered
    pub fn replica_remote(&self) -> Option<Arc<dyn BackendPlugin>> {
        self.resolve(self.replica_remote.get())
    }
}

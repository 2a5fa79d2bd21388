//! Per-destination HTTP version table and one-shot connection handoff.
//!
//! Both tables are sharded `DashMap`s. Waiting for a destination that is being dialed
//! happens on that destination's own watch channel, outside any shard lock, so one slow
//! handshake never stalls other hosts.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mimic_traits::ConnVersion;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

enum VersionEntry {
    Pending(watch::Receiver<Option<ConnVersion>>),
    Resolved(ConnVersion),
}

/// Holds one value that can be moved out exactly once.
struct HandoffCell<C> {
    slot: Mutex<Option<C>>,
}

impl<C> HandoffCell<C> {
    fn new(value: C) -> Self {
        Self { slot: Mutex::new(Some(value)) }
    }

    fn take(&self) -> Option<C> {
        self.slot.lock().take()
    }
}

pub struct ConnectionArbitrator<C> {
    versions: DashMap<String, VersionEntry>,
    waiting: DashMap<String, HandoffCell<C>>,
}

/// Outcome of [`ConnectionArbitrator::claim_or_become_owner`].
pub enum Claim<'a, C> {
    Resolved(ConnVersion),
    /// The caller is the only one dialing this destination until the guard goes away.
    MustDial(OwnerGuard<'a, C>),
}

impl<C> Default for ConnectionArbitrator<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ConnectionArbitrator<C> {
    pub fn new() -> Self {
        Self {
            versions: DashMap::new(),
            waiting: DashMap::new(),
        }
    }

    pub fn lookup_version(&self, key: &str) -> ConnVersion {
        match self.versions.get(key).as_deref() {
            Some(VersionEntry::Resolved(version)) => *version,
            Some(VersionEntry::Pending(_)) => ConnVersion::Pending,
            None => ConnVersion::Unknown,
        }
    }

    /// Records the terminal version for `key`. A key that is already resolved keeps its
    /// version; `Unknown` and `Pending` are ignored.
    pub fn resolve_version(&self, key: &str, version: ConnVersion) {
        if !version.is_resolved() {
            debug!(key, ?version, "ignoring non-terminal version");
            return;
        }
        match self.versions.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if let VersionEntry::Pending(_) = entry.get() {
                    entry.insert(VersionEntry::Resolved(version));
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(VersionEntry::Resolved(version));
            }
        }
    }

    /// Single-flight entry point for first contact with `key`.
    ///
    /// The first caller for an unknown key gets [`Claim::MustDial`]; everyone else waits
    /// until that owner resolves the key. If the owner gives up, one of the waiters
    /// becomes the next owner.
    pub async fn claim_or_become_owner(&self, key: &str) -> Claim<'_, C> {
        loop {
            let mut pending = match self.versions.entry(key.to_string()) {
                Entry::Occupied(entry) => match entry.get() {
                    VersionEntry::Resolved(version) => return Claim::Resolved(*version),
                    VersionEntry::Pending(rx) => rx.clone(),
                },
                Entry::Vacant(entry) => {
                    let (tx, rx) = watch::channel(None);
                    entry.insert(VersionEntry::Pending(rx));
                    debug!(key, "became dial owner");
                    return Claim::MustDial(OwnerGuard {
                        arbiter: self,
                        key: key.to_string(),
                        tx: Some(tx),
                    });
                }
            };

            let resolved = pending.wait_for(Option::is_some).await.ok().and_then(|v| *v);
            if let Some(version) = resolved {
                return Claim::Resolved(version);
            }
            // Owner released without resolving; look again.
        }
    }

    /// Parks a handshaked connection for `key`, replacing any unclaimed one.
    pub fn offer_connection(&self, key: &str, connection: C) {
        self.waiting.insert(key.to_string(), HandoffCell::new(connection));
    }

    /// Takes the parked connection for `key`. At most one caller ever receives it.
    pub fn claim_connection(&self, key: &str) -> Option<C> {
        self.waiting.remove(key).and_then(|(_, cell)| cell.take())
    }

    fn release(&self, key: &str) {
        self.versions
            .remove_if(key, |_, entry| matches!(entry, VersionEntry::Pending(_)));
    }
}

/// Dial obligation for one key. Dropping it without [`OwnerGuard::resolve`] returns the
/// key to `Unknown` and wakes the waiters, whatever the exit path.
pub struct OwnerGuard<'a, C> {
    arbiter: &'a ConnectionArbitrator<C>,
    key: String,
    tx: Option<watch::Sender<Option<ConnVersion>>>,
}

impl<C> OwnerGuard<'_, C> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Publishes `version` to waiters. A non-terminal version releases the key instead.
    pub fn resolve(mut self, version: ConnVersion) {
        if !version.is_resolved() {
            return;
        }
        self.arbiter.resolve_version(&self.key, version);
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(version));
        }
    }
}

impl<C> Drop for OwnerGuard<'_, C> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            debug!(key = %self.key, "dial owner released without a version");
            self.arbiter.release(&self.key);
            drop(tx);
        }
    }
}

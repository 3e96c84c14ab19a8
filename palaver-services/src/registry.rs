use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use palaver_core::xmpp::error::StreamErrorKind;
use palaver_core::xmpp::jid::Jid;
use palaver_core::xmpp::stanza::Stanza;

pub type ConnectionId = Uuid;

/// Out-of-band instruction for a connection task, delivered on a channel
/// separate from the stanza mailbox so it cannot be crowded out.
#[derive(Debug, Clone, Copy)]
pub enum SessionControl {
    /// Announce the stream error and close the connection.
    Close(StreamErrorKind),
}

/// Channels into one connection task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub stanzas: mpsc::Sender<Stanza>,
    pub control: mpsc::Sender<SessionControl>,
}

#[derive(Debug)]
struct SessionEntry {
    connection_id: ConnectionId,
    handle: SessionHandle,
    /// Set by initial presence; sessions start unavailable.
    available: bool,
    priority: i8,
    /// Monotonic bind order, used to break priority ties.
    bound_seq: u64,
}

/// What to do when a requested resource is already bound by another
/// connection of the same account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Assign a fresh `<requested>-<8 hex>` resource to the new session.
    #[default]
    Suffix,
    /// Close the older session with a `<conflict/>` stream error.
    Kick,
}

#[derive(Debug)]
pub struct BindOutcome {
    pub full_jid: Jid,
    /// The connection that was displaced, under the kick policy.
    pub kicked: Option<ConnectionId>,
}

#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("requested resource is not acceptable")]
    InvalidResource,
}

/// Shared map of bound sessions: `bare JID → resource → session`.
///
/// Every (bare JID, resource) pair maps to at most one connection. All
/// operations are atomic with respect to concurrent callers; per-account
/// state is guarded by the shard entry it lives in.
pub struct ResourceRegistry {
    sessions: DashMap<Jid, BTreeMap<String, SessionEntry>>,
    bindings: DashMap<ConnectionId, Jid>,
    bind_seq: AtomicU64,
    conflict_policy: ConflictPolicy,
}

impl ResourceRegistry {
    pub fn new(conflict_policy: ConflictPolicy) -> Self {
        Self {
            sessions: DashMap::new(),
            bindings: DashMap::new(),
            bind_seq: AtomicU64::new(0),
            conflict_policy,
        }
    }

    /// Binds a resource for `bare_jid`, generating one when the request is
    /// absent and resolving conflicts per the configured policy.
    pub fn bind(
        &self,
        bare_jid: &Jid,
        requested_resource: Option<&str>,
        connection_id: ConnectionId,
        handle: SessionHandle,
    ) -> Result<BindOutcome, BindError> {
        // A rebind by the same connection releases its previous resource.
        self.release_connection(connection_id);

        let bare = bare_jid.to_bare();
        let mut kicked = None;

        let mut resources = self.sessions.entry(bare.clone()).or_default();

        let resource = match requested_resource {
            Some(requested) => {
                if bare.bind(requested).is_err() {
                    return Err(BindError::InvalidResource);
                }
                match resources.get(requested) {
                    None => requested.to_string(),
                    Some(existing) => match self.conflict_policy {
                        ConflictPolicy::Suffix => free_resource(&resources, requested),
                        ConflictPolicy::Kick => {
                            let old_connection = existing.connection_id;
                            let old_control = existing.handle.control.clone();
                            let _ = old_control
                                .try_send(SessionControl::Close(StreamErrorKind::Conflict));
                            resources.remove(requested);
                            self.bindings.remove(&old_connection);
                            kicked = Some(old_connection);
                            requested.to_string()
                        }
                    },
                }
            }
            None => free_resource(&resources, "resource"),
        };

        let full_jid = bare
            .bind(&resource)
            .map_err(|_| BindError::InvalidResource)?;

        resources.insert(
            resource,
            SessionEntry {
                connection_id,
                handle,
                available: false,
                priority: 0,
                bound_seq: self.bind_seq.fetch_add(1, Ordering::Relaxed),
            },
        );
        drop(resources);

        self.bindings.insert(connection_id, full_jid.clone());
        debug!(jid = %full_jid, connection = %connection_id, "bound resource");

        Ok(BindOutcome { full_jid, kicked })
    }

    /// Releases one binding. Only the owning connection may release it.
    pub fn release(&self, full_jid: &Jid, connection_id: ConnectionId) -> bool {
        let Some(resource) = full_jid.resource() else {
            return false;
        };
        let bare = full_jid.to_bare();

        let removed = match self.sessions.get_mut(&bare) {
            Some(mut resources) => match resources.get(resource) {
                Some(entry) if entry.connection_id == connection_id => {
                    resources.remove(resource);
                    true
                }
                _ => false,
            },
            None => false,
        };

        if removed {
            self.bindings
                .remove_if(&connection_id, |_, bound| bound == full_jid);
            self.sessions
                .remove_if(&bare, |_, resources| resources.is_empty());
            debug!(jid = %full_jid, connection = %connection_id, "released resource");
        }

        removed
    }

    /// Removes every binding owned by a connection; called on disconnect.
    pub fn release_connection(&self, connection_id: ConnectionId) -> usize {
        let mut released = 0;
        while let Some((_, full_jid)) = self.bindings.remove(&connection_id) {
            let bare = full_jid.to_bare();
            if let Some(resource) = full_jid.resource() {
                if let Some(mut resources) = self.sessions.get_mut(&bare) {
                    if resources
                        .get(resource)
                        .is_some_and(|entry| entry.connection_id == connection_id)
                    {
                        resources.remove(resource);
                        released += 1;
                    }
                }
            }
            self.sessions
                .remove_if(&bare, |_, resources| resources.is_empty());
        }
        released
    }

    pub fn lookup(&self, full_jid: &Jid) -> Option<ConnectionId> {
        self.entry_for(full_jid)
            .map(|(connection_id, _)| connection_id)
    }

    pub fn lookup_all(&self, bare_jid: &Jid) -> Vec<(String, ConnectionId)> {
        match self.sessions.get(&bare_jid.to_bare()) {
            Some(resources) => resources
                .iter()
                .map(|(resource, entry)| (resource.clone(), entry.connection_id))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn handle_for(&self, full_jid: &Jid) -> Option<SessionHandle> {
        self.entry_for(full_jid).map(|(_, handle)| handle)
    }

    /// All sessions of an account, with their full JIDs.
    pub fn all_sessions(&self, bare_jid: &Jid) -> Vec<(Jid, SessionHandle)> {
        let bare = bare_jid.to_bare();
        match self.sessions.get(&bare) {
            Some(resources) => resources
                .iter()
                .filter_map(|(resource, entry)| {
                    let full = bare.bind(resource).ok()?;
                    Some((full, entry.handle.clone()))
                })
                .collect(),
            None => Vec::new(),
        }
    }

    /// The available session with the highest priority, newest bind winning
    /// ties. `None` when no session is available.
    pub fn best_session(&self, bare_jid: &Jid) -> Option<(Jid, SessionHandle)> {
        let bare = bare_jid.to_bare();
        let resources = self.sessions.get(&bare)?;
        let (resource, entry) = resources
            .iter()
            .filter(|(_, entry)| entry.available)
            .max_by_key(|(_, entry)| (entry.priority, entry.bound_seq))?;
        let full = bare.bind(resource).ok()?;
        Some((full, entry.handle.clone()))
    }

    /// Records the availability and priority announced by a session's
    /// presence. Returns false when the session is not bound.
    pub fn update_presence(&self, full_jid: &Jid, available: bool, priority: i8) -> bool {
        let Some(resource) = full_jid.resource() else {
            return false;
        };
        match self.sessions.get_mut(&full_jid.to_bare()) {
            Some(mut resources) => match resources.get_mut(resource) {
                Some(entry) => {
                    entry.available = available;
                    entry.priority = priority;
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// Sends a control instruction to every bound session.
    pub fn broadcast_control(&self, control: SessionControl) {
        for resources in self.sessions.iter() {
            for entry in resources.values() {
                let _ = entry.handle.control.try_send(control);
            }
        }
    }

    fn entry_for(&self, full_jid: &Jid) -> Option<(ConnectionId, SessionHandle)> {
        let resource = full_jid.resource()?;
        let resources = self.sessions.get(&full_jid.to_bare())?;
        let entry = resources.get(resource)?;
        Some((entry.connection_id, entry.handle.clone()))
    }
}

/// Picks `<base>-<8 hex>` until it does not collide.
fn free_resource(resources: &BTreeMap<String, SessionEntry>, base: &str) -> String {
    loop {
        let candidate = format!("{}-{:08x}", base, rand::random::<u32>());
        if !resources.contains_key(&candidate) {
            return candidate;
        }
    }
}

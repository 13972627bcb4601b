//! Master Key Manager: process-wide master key lifecycle.
//!
//! Owns `(current_master_key_id, current_uuid)` behind a single mutex.
//! Hands out the current master key for encryption, fetches specific past
//! master keys for decryption, and drives rotation plus the re-wrap of
//! every known tablespace's key that rotation requires.

use parking_lot::Mutex;

use crate::innodb::key_namer::{master_key_name, master_key_name_legacy};
use crate::innodb::context::EncryptionContext;
use crate::innodb::keyring::KeyringGateway;
use crate::IdbError;

/// Injectable collaborator that knows about every encrypted tablespace's
/// current [`EncryptionContext`] and can re-wrap it under a new master
/// key. The real buffer pool / tablespace catalogue implementation lives
/// outside this core; only the trait and an in-memory test double ship
/// here.
pub trait TablespaceKeyStore {
    /// All tablespace contexts currently known to the store.
    fn contexts(&self) -> Vec<EncryptionContext>;

    /// Replace the stored context for a tablespace with one re-wrapped
    /// under the new master key id/uuid. `old` identifies which
    /// tablespace by its prior `(key_id, uuid)`.
    fn rewrap(&mut self, old: &EncryptionContext, new_key_id: u32, new_uuid: &str) -> Result<(), IdbError>;
}

/// A `Vec`-backed [`TablespaceKeyStore`] for tests and simple embedders.
#[derive(Default)]
pub struct InMemoryTablespaceKeyStore {
    contexts: Vec<EncryptionContext>,
}

impl InMemoryTablespaceKeyStore {
    /// An empty store.
    pub fn new() -> Self {
        InMemoryTablespaceKeyStore { contexts: Vec::new() }
    }

    /// Track an additional tablespace context.
    pub fn push(&mut self, ctx: EncryptionContext) {
        self.contexts.push(ctx);
    }
}

impl TablespaceKeyStore for InMemoryTablespaceKeyStore {
    fn contexts(&self) -> Vec<EncryptionContext> {
        self.contexts.clone()
    }

    fn rewrap(&mut self, old: &EncryptionContext, new_key_id: u32, new_uuid: &str) -> Result<(), IdbError> {
        for ctx in &mut self.contexts {
            if ctx.key_id == old.key_id && ctx.uuid == old.uuid {
                ctx.key_id = new_key_id;
                ctx.uuid = new_uuid.to_string();
            }
        }
        Ok(())
    }
}

struct MasterKeyState {
    current_master_key_id: u32,
    current_uuid: String,
}

/// Process-wide master key lifecycle manager.
pub struct MasterKeyManager<G: KeyringGateway> {
    gateway: G,
    prefix: String,
    legacy_server_id: Option<String>,
    state: Mutex<MasterKeyState>,
}

impl<G: KeyringGateway> MasterKeyManager<G> {
    /// Build a manager with no master key created yet
    /// (`current_master_key_id == 0`).
    pub fn new(gateway: G, prefix: impl Into<String>) -> Self {
        MasterKeyManager {
            gateway,
            prefix: prefix.into(),
            legacy_server_id: None,
            state: Mutex::new(MasterKeyState {
                current_master_key_id: 0,
                current_uuid: String::new(),
            }),
        }
    }

    /// Set the legacy `server_id`-based name fallback used by
    /// [`MasterKeyManager::get_master_key`] and
    /// [`MasterKeyManager::get_or_create_master_key`] when the uuid-based
    /// name is not found (5.7.11 compatibility).
    pub fn with_legacy_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.legacy_server_id = Some(server_id.into());
        self
    }

    /// Current master key id (0 means none created yet).
    pub fn current_id(&self) -> u32 {
        self.state.lock().current_master_key_id
    }

    /// Current server uuid the active master key is scoped to.
    pub fn current_uuid(&self) -> String {
        self.state.lock().current_uuid.clone()
    }

    /// Return the current master key, generating and lazily installing a
    /// first master key if none exists yet.
    pub fn get_or_create_master_key(&mut self, server_uuid: &str) -> Result<(u32, [u8; 32]), IdbError> {
        let mut state = self.state.lock();
        if state.current_master_key_id == 0 {
            let name = master_key_name(&self.prefix, server_uuid, 1);
            if self.gateway.fetch(&name)?.is_none() {
                tracing::info!(name = %name, "creating first master key");
                self.gateway.generate(&name, "AES", 32)?;
            }
            let (bytes, _) = self
                .gateway
                .fetch(&name)?
                .ok_or_else(|| IdbError::KeyringUnavailable(format!("failed to create master key '{}'", name)))?;
            let key = to_key32(&bytes)?;
            state.current_master_key_id = 1;
            state.current_uuid = server_uuid.to_string();
            return Ok((1, key));
        }

        let id = state.current_master_key_id;
        let uuid = state.current_uuid.clone();
        drop(state);
        let key = self.fetch_by_name(&uuid, id)?;
        Ok((id, key))
    }

    /// Fetch a specific master key by id and (optionally) uuid. `uuid ==
    /// None` goes straight to the legacy `server_id`-based name.
    pub fn get_master_key(&self, id: u32, uuid: Option<&str>) -> Result<[u8; 32], IdbError> {
        match uuid {
            Some(uuid) => self.fetch_by_name(uuid, id),
            None => self.fetch_legacy(id),
        }
    }

    fn fetch_by_name(&self, uuid: &str, id: u32) -> Result<[u8; 32], IdbError> {
        let name = master_key_name(&self.prefix, uuid, id);
        tracing::debug!(name = %name, "resolving master key name");
        match self.gateway.fetch(&name)? {
            Some((bytes, _)) => to_key32(&bytes),
            None => {
                tracing::warn!(name = %name, "uuid-scoped master key not found, trying legacy name");
                self.fetch_legacy(id)
            }
        }
    }

    fn fetch_legacy(&self, id: u32) -> Result<[u8; 32], IdbError> {
        let server_id = self
            .legacy_server_id
            .as_deref()
            .ok_or_else(|| IdbError::KeyNotFound(format!("master key id {} not found and no legacy server_id configured", id)))?;
        let name = master_key_name_legacy(&self.prefix, server_id, id);
        let (bytes, _) = self
            .gateway
            .fetch(&name)?
            .ok_or_else(|| IdbError::KeyNotFound(format!("master key '{}' not found", name)))?;
        to_key32(&bytes)
    }

    /// Generate and install a new master key, advancing the current id.
    /// Does not re-wrap existing tablespaces; call
    /// [`MasterKeyManager::rewrap_all`] afterwards with the tablespace
    /// store.
    pub fn rotate(&mut self, server_uuid: &str) -> Result<u32, IdbError> {
        let (next_id, name) = {
            let state = self.state.lock();
            let next_id = state.current_master_key_id + 1;
            (next_id, master_key_name(&self.prefix, server_uuid, next_id))
        };

        self.gateway.generate(&name, "AES", 32)?;
        if self.gateway.fetch(&name)?.is_none() {
            return Err(IdbError::KeyringUnavailable(format!(
                "rotation could not confirm newly generated key '{}'",
                name
            )));
        }

        let mut state = self.state.lock();
        state.current_master_key_id = next_id;
        state.current_uuid = server_uuid.to_string();
        tracing::info!(new_id = next_id, "master key rotation complete");
        Ok(next_id)
    }

    /// Re-wrap every tablespace context in `store` under the current
    /// master key. Refuses (returns [`IdbError::UnsupportedMode`]) if any
    /// context is `legacy_read_only` — such a context has no uuid to
    /// re-wrap under safely (see `EncryptionContext::legacy_read_only`).
    pub fn rewrap_all(&self, store: &mut dyn TablespaceKeyStore) -> Result<(), IdbError> {
        let (id, uuid) = {
            let state = self.state.lock();
            (state.current_master_key_id, state.current_uuid.clone())
        };
        for ctx in store.contexts() {
            if ctx.legacy_read_only {
                return Err(IdbError::UnsupportedMode(
                    "refusing to rotate a tablespace whose encryption info is still legacy V1 (no uuid)".to_string(),
                ));
            }
            store.rewrap(&ctx, id, &uuid)?;
        }
        Ok(())
    }

    /// Advance the process-wide master key id after decoding an
    /// encryption info blob whose `master_key_id` is newer than what this
    /// process has seen (e.g. catch-up after a restart). Never rewinds.
    pub fn catch_up(&self, master_key_id: u32, server_uuid: &str) {
        let mut state = self.state.lock();
        if master_key_id > state.current_master_key_id {
            state.current_master_key_id = master_key_id;
            state.current_uuid = server_uuid.to_string();
        }
    }

    /// Probe keyring reachability. For a fresh instance (no master key
    /// yet) this generates and removes a dummy key; otherwise it fetches
    /// the current master key.
    pub fn check_alive(&mut self) -> bool {
        let id = self.current_id();
        if id == 0 {
            self.gateway.is_alive()
        } else {
            let uuid = self.current_uuid();
            self.fetch_by_name(&uuid, id).is_ok()
        }
    }
}

fn to_key32(bytes: &[u8]) -> Result<[u8; 32], IdbError> {
    if bytes.len() != 32 {
        return Err(IdbError::KeyringUnavailable(format!(
            "master key has wrong length: expected 32, got {}",
            bytes.len()
        )));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(bytes);
    Ok(key)
}

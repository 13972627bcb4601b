//! Keyring Gateway: the narrow capability through which all key material
//! enters and leaves the process.
//!
//! [`KeyringGateway`] is the trait the Master Key Manager and Encryption
//! Info Codec are written against. [`FileKeyring`] implements it on top of
//! the on-disk MySQL `keyring_file` plugin binary format (MySQL 5.7.11+):
//! length-prefixed, XOR-obfuscated entries with a trailing SHA-256 digest.
//! [`InMemoryKeyring`] is a `HashMap`-backed test double with the same
//! contract, for tests and embedders that do not want a real keyring file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::IdbError;

/// XOR obfuscation key used by MySQL's `keyring_file` plugin.
const OBFUSCATE_KEY: &[u8] = b"*305=Ljt0*!@$Hnm(*-9-w;:";

/// Fixed probe name used by [`KeyringGateway::is_alive`].
pub const ALIVE_PROBE_NAME: &str = "percona_keyring_test";

/// A single entry from a MySQL keyring file.
#[derive(Debug, Clone)]
pub struct KeyringEntry {
    /// Key identifier (e.g., `INNODBKey-{uuid}-{id}`).
    pub key_id: String,
    /// Key type (e.g., `AES`).
    pub key_type: String,
    /// User ID associated with the key.
    pub user_id: String,
    /// De-obfuscated key data.
    pub key_data: Vec<u8>,
}

/// Narrow capability over an external key-value keyring.
///
/// Implementations report failures up without retry and do not cache —
/// the gateway's job is plumbing, not policy.
pub trait KeyringGateway {
    /// Create a new random key of `len` bytes under `name`, tagged `algo`.
    /// A name collision is implementation-defined but must not silently
    /// overwrite an existing key.
    fn generate(&mut self, name: &str, algo: &str, len: usize) -> Result<(), IdbError>;

    /// Fetch the raw bytes and type tag stored under `name`, or `None` if
    /// no such entry exists.
    fn fetch(&self, name: &str) -> Result<Option<(Vec<u8>, String)>, IdbError>;

    /// Remove the entry stored under `name`. Removing an absent name is
    /// not an error.
    fn remove(&mut self, name: &str) -> Result<(), IdbError>;

    /// Probe whether the keyring responds, by fetch-or-generate of a fixed
    /// name. Returns `true` if the keyring is reachable.
    fn is_alive(&mut self) -> bool {
        match self.fetch(ALIVE_PROBE_NAME) {
            Ok(Some(_)) => true,
            Ok(None) => self.generate(ALIVE_PROBE_NAME, "AES", 32).is_ok(),
            Err(_) => false,
        }
    }
}

/// A parsed (and optionally persisted) MySQL keyring file.
#[derive(Debug)]
pub struct FileKeyring {
    entries: Vec<KeyringEntry>,
    path: Option<PathBuf>,
}

impl FileKeyring {
    /// An empty in-memory keyring with no backing file (not persisted by
    /// `generate`/`remove` unless [`FileKeyring::save`] is called
    /// explicitly, or [`FileKeyring::load`] with a real path is used).
    pub fn empty() -> Self {
        FileKeyring {
            entries: Vec::new(),
            path: None,
        }
    }

    /// Load and parse a MySQL `keyring_file` from disk.
    ///
    /// Reads the binary file, verifies the trailing SHA-256 checksum,
    /// and parses all key entries with XOR de-obfuscation. Future
    /// `generate`/`remove` calls persist back to this path.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, IdbError> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .map_err(|e| IdbError::Io(format!("Cannot read keyring file {}: {}", path.display(), e)))?;

        if data.len() < 32 {
            return Err(IdbError::Parse(
                "Keyring file too small (must contain at least SHA-256 digest)".to_string(),
            ));
        }

        let content_len = data.len() - 32;
        let content = &data[..content_len];
        let stored_hash = &data[content_len..];

        let mut hasher = Sha256::new();
        hasher.update(content);
        let computed_hash = hasher.finalize();

        if computed_hash.as_slice() != stored_hash {
            return Err(IdbError::Parse(
                "Keyring file SHA-256 checksum mismatch (file may be corrupt)".to_string(),
            ));
        }

        let entries = parse_entries(content)?;

        Ok(FileKeyring {
            entries,
            path: Some(path.to_path_buf()),
        })
    }

    /// Serialize all entries and write them (with a fresh trailing
    /// SHA-256 digest) to `path`, remembering `path` for future saves.
    pub fn save_as<P: AsRef<Path>>(&mut self, path: P) -> Result<(), IdbError> {
        self.path = Some(path.as_ref().to_path_buf());
        self.save()
    }

    /// Re-serialize to the path this keyring was loaded from (or last
    /// saved to). No-op if there is no known path.
    pub fn save(&self) -> Result<(), IdbError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut data = Vec::new();
        for entry in &self.entries {
            data.extend_from_slice(&serialize_entry(entry));
        }
        let mut hasher = Sha256::new();
        hasher.update(&data);
        let hash = hasher.finalize();
        data.extend_from_slice(&hash);
        std::fs::write(path, &data)
            .map_err(|e| IdbError::Io(format!("Cannot write keyring file {}: {}", path.display(), e)))
    }

    /// Find a key entry by its full key ID string.
    pub fn find_key(&self, key_id: &str) -> Option<&KeyringEntry> {
        self.entries.iter().find(|e| e.key_id == key_id)
    }

    /// Find the InnoDB master key for a given server UUID and key ID number.
    ///
    /// Constructs the key ID as `INNODBKey-{server_uuid}-{id}` and looks it
    /// up in the keyring.
    pub fn find_innodb_master_key(&self, server_uuid: &str, key_id: u32) -> Option<&[u8]> {
        let full_id = format!("INNODBKey-{}-{}", server_uuid, key_id);
        self.find_key(&full_id).map(|e| e.key_data.as_slice())
    }

    /// Returns the number of entries in the keyring.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the keyring contains no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyringGateway for FileKeyring {
    fn generate(&mut self, name: &str, algo: &str, len: usize) -> Result<(), IdbError> {
        if self.find_key(name).is_some() {
            return Err(IdbError::KeyringUnavailable(format!(
                "key '{}' already exists",
                name
            )));
        }
        let mut key_data = vec![0u8; len];
        rand::rng().fill_bytes(&mut key_data);
        self.entries.push(KeyringEntry {
            key_id: name.to_string(),
            key_type: algo.to_string(),
            user_id: String::new(),
            key_data,
        });
        self.save()
    }

    fn fetch(&self, name: &str) -> Result<Option<(Vec<u8>, String)>, IdbError> {
        Ok(self
            .find_key(name)
            .map(|e| (e.key_data.clone(), e.key_type.clone())))
    }

    fn remove(&mut self, name: &str) -> Result<(), IdbError> {
        self.entries.retain(|e| e.key_id != name);
        self.save()
    }
}

/// XOR de-obfuscate key data using MySQL's obfuscation key.
fn deobfuscate(data: &mut [u8]) {
    let key_len = OBFUSCATE_KEY.len();
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= OBFUSCATE_KEY[i % key_len];
    }
}

/// Read a little-endian u64 from a byte slice.
fn read_le_u64(data: &[u8]) -> u64 {
    u64::from_le_bytes(data[..8].try_into().unwrap())
}

/// Serialize one entry back to its on-disk representation.
fn serialize_entry(entry: &KeyringEntry) -> Vec<u8> {
    let mut obfuscated = entry.key_data.clone();
    deobfuscate(&mut obfuscated);

    let pod_size =
        40 + entry.key_id.len() + entry.key_type.len() + entry.user_id.len() + entry.key_data.len();
    let mut out = Vec::with_capacity(pod_size);
    out.extend_from_slice(&(pod_size as u64).to_le_bytes());
    out.extend_from_slice(&(entry.key_id.len() as u64).to_le_bytes());
    out.extend_from_slice(&(entry.key_type.len() as u64).to_le_bytes());
    out.extend_from_slice(&(entry.user_id.len() as u64).to_le_bytes());
    out.extend_from_slice(&(entry.key_data.len() as u64).to_le_bytes());
    out.extend_from_slice(entry.key_id.as_bytes());
    out.extend_from_slice(entry.key_type.as_bytes());
    out.extend_from_slice(entry.user_id.as_bytes());
    out.extend_from_slice(&obfuscated);
    out
}

/// Parse all keyring entries from the content portion of the file.
fn parse_entries(mut data: &[u8]) -> Result<Vec<KeyringEntry>, IdbError> {
    let mut entries = Vec::new();

    while !data.is_empty() {
        if data.len() < 40 {
            break;
        }

        let pod_size = read_le_u64(&data[0..8]) as usize;
        let key_id_len = read_le_u64(&data[8..16]) as usize;
        let key_type_len = read_le_u64(&data[16..24]) as usize;
        let user_id_len = read_le_u64(&data[24..32]) as usize;
        let key_len = read_le_u64(&data[32..40]) as usize;

        let header_size = 40;
        let total_data = key_id_len + key_type_len + user_id_len + key_len;
        let entry_size = header_size + total_data;

        if pod_size == 0 || entry_size > data.len() {
            break;
        }

        let mut offset = header_size;

        let key_id = String::from_utf8_lossy(&data[offset..offset + key_id_len]).to_string();
        offset += key_id_len;

        let key_type = String::from_utf8_lossy(&data[offset..offset + key_type_len]).to_string();
        offset += key_type_len;

        let user_id = String::from_utf8_lossy(&data[offset..offset + user_id_len]).to_string();
        offset += user_id_len;

        let mut key_data = data[offset..offset + key_len].to_vec();
        deobfuscate(&mut key_data);

        entries.push(KeyringEntry {
            key_id,
            key_type,
            user_id,
            key_data,
        });

        data = &data[entry_size..];
    }

    Ok(entries)
}

/// `HashMap`-backed keyring test double implementing the same contract as
/// [`FileKeyring`], without any on-disk format.
#[derive(Debug, Default)]
pub struct InMemoryKeyring {
    entries: HashMap<String, (Vec<u8>, String)>,
}

impl InMemoryKeyring {
    /// A fresh, empty in-memory keyring.
    pub fn new() -> Self {
        InMemoryKeyring {
            entries: HashMap::new(),
        }
    }

    /// Insert a key directly, bypassing `generate`'s random fill — useful
    /// for tests that need a specific key value.
    pub fn insert(&mut self, name: &str, key_data: Vec<u8>, algo: &str) {
        self.entries.insert(name.to_string(), (key_data, algo.to_string()));
    }
}

impl KeyringGateway for InMemoryKeyring {
    fn generate(&mut self, name: &str, algo: &str, len: usize) -> Result<(), IdbError> {
        if self.entries.contains_key(name) {
            return Err(IdbError::KeyringUnavailable(format!(
                "key '{}' already exists",
                name
            )));
        }
        let mut key_data = vec![0u8; len];
        rand::rng().fill_bytes(&mut key_data);
        self.entries.insert(name.to_string(), (key_data, algo.to_string()));
        Ok(())
    }

    fn fetch(&self, name: &str) -> Result<Option<(Vec<u8>, String)>, IdbError> {
        Ok(self.entries.get(name).cloned())
    }

    fn remove(&mut self, name: &str) -> Result<(), IdbError> {
        self.entries.remove(name);
        Ok(())
    }
}

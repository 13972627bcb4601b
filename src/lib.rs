//! Transparent tablespace encryption core.
//!
//! The `idb` crate provides the key-management and block-cipher core of a
//! relational storage engine's transparent data-at-rest encryption: a
//! keyring-backed master key lifecycle, per-tablespace key wrapping, the
//! on-disk encryption info codec, and the page/log-block cryptor that
//! every byte written to or read from data and log files passes through.
//!
//! ## Quick example
//!
//! ```
//! use idb::innodb::keyring::InMemoryKeyring;
//! use idb::innodb::master_key::MasterKeyManager;
//! use idb::innodb::context::{EncryptionContext, EncryptionMode};
//! use idb::innodb::cryptor::{encrypt_page, decrypt_page};
//!
//! let gateway = InMemoryKeyring::new();
//! let mut mgr = MasterKeyManager::new(gateway, "INNODBKey");
//! let (id, master_key) = mgr.get_or_create_master_key("12345678-1234-1234-1234-123456789abc").unwrap();
//!
//! let ctx = EncryptionContext::new(
//!     EncryptionMode::Aes,
//!     [0x11; 32],
//!     [0x22; 32],
//!     0,
//!     id,
//!     "12345678-1234-1234-1234-123456789abc".to_string(),
//! );
//! let _ = master_key; // the master key wraps the tablespace key on disk, not shown here
//!
//! let mut page = vec![0xABu8; 16384];
//! page[24] = 0; page[25] = 17; // INDEX page type, big-endian u16
//! let mut ciphertext = vec![0u8; page.len()];
//! encrypt_page(&ctx, &page, &mut ciphertext).unwrap();
//! let mut plaintext = vec![0u8; page.len()];
//! decrypt_page(&ctx, &ciphertext, &mut plaintext).unwrap();
//! assert_eq!(plaintext, page);
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`innodb::keyring`] | Keyring Gateway: `KeyringGateway` trait, `FileKeyring`, `InMemoryKeyring` |
//! | [`innodb::key_namer`] | Canonical keyring name construction for master/system keys |
//! | [`innodb::master_key`] | Process-wide master key lifecycle: create, fetch, rotate, rewrap |
//! | [`innodb::encryption_info`] | Encryption info blob codec (V1/V2/V3 + redo-log RK_V2) |
//! | [`innodb::context`] | `EncryptionContext` / `EncryptionMode`, the per-tablespace crypto state |
//! | [`innodb::cryptor`] | Page and log-block AES-256-CBC encrypt/decrypt |
//! | [`innodb::page`] | FIL header/trailer, FSP header parsing |
//! | [`innodb::page_types`] | Page type enum with names and descriptions |
//! | [`innodb::constants`] | InnoDB page/file structure and encryption-layout constants |

pub mod innodb;

use thiserror::Error;

/// Errors returned by `idb` operations.
#[derive(Error, Debug)]
pub enum IdbError {
    /// An I/O error occurred (file open, read, seek, or write failure).
    #[error("I/O error: {0}")]
    Io(String),

    /// A parse error occurred (malformed binary data or unexpected values).
    #[error("Parse error: {0}")]
    Parse(String),

    /// An invalid argument was supplied (out-of-range page number, bad option, etc.).
    #[error("Invalid argument: {0}")]
    Argument(String),

    /// The keyring did not respond, or responded with failure, to a request.
    #[error("Keyring unavailable: {0}")]
    KeyringUnavailable(String),

    /// A named key was not found in the keyring.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// An encryption info blob failed its magic or CRC check.
    #[error("Encryption info corrupt: {0}")]
    InfoCorrupt(String),

    /// The AES primitive (or an alignment precondition) failed on encrypt.
    #[error("Encrypt failed: {0}")]
    EncryptFail(String),

    /// The AES primitive (or an alignment precondition) failed on decrypt.
    #[error("Decrypt failed: {0}")]
    DecryptFail(String),

    /// The requested encryption mode is not supported in this context.
    #[error("Unsupported encryption mode: {0}")]
    UnsupportedMode(String),

    /// An internal invariant was violated (e.g. encrypting an
    /// already-encrypted page).
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

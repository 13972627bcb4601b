//! Transparent tablespace encryption for InnoDB's on-disk format.
//!
//! This module provides the keyring gateway, key namer, master key
//! manager, `ENCRYPTION_INFO` codec, and page/log cryptor needed to
//! encrypt and decrypt `.ibd` pages and redo log blocks the way
//! InnoDB's own key-management layer does.
//!
//! Start with [`keyring::FileKeyring`] and [`master_key::MasterKeyManager`]
//! to set up key material, [`encryption_info::encode_info`] /
//! [`encryption_info::decode_info`] to wrap/unwrap a tablespace key, and
//! [`cryptor::encrypt_page`] / [`cryptor::decrypt_page`] to transform pages.

pub mod constants;
pub mod context;
pub mod cryptor;
pub mod encryption_info;
pub mod key_namer;
pub mod keyring;
pub mod master_key;
pub mod page;
pub mod page_types;

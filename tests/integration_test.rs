//! End-to-end tests wiring the keyring, master key manager, encryption
//! info codec, and page/log cryptor together the way a tablespace open
//! path would.

use byteorder::{BigEndian, ByteOrder};
use tempfile::NamedTempFile;

use idb::innodb::constants::*;
use idb::innodb::context::{EncryptionContext, EncryptionMode};
use idb::innodb::cryptor::{decrypt_log, decrypt_page, encrypt_log, encrypt_page};
use idb::innodb::encryption_info::{decode_info, encode_info, resolve_encode_master_key, RedoLogEncryptionInfo};
use idb::innodb::keyring::FileKeyring;
use idb::innodb::master_key::MasterKeyManager;
use idb::innodb::page_types::PageType;

const PAGE_SIZE: usize = 16384;
const SERVER_UUID: &str = "12345678-1234-1234-1234-123456789abc";

fn sample_page(page_type: u16) -> Vec<u8> {
    let mut page = vec![0u8; PAGE_SIZE];
    for (i, b) in page.iter_mut().enumerate() {
        *b = (i % 255) as u8;
    }
    BigEndian::write_u16(&mut page[FIL_PAGE_TYPE..], page_type);
    page
}

/// A tablespace is opened for the first time: no master key exists yet,
/// the keyring lives in a real file on disk, a tablespace key is wrapped
/// into a V3 info blob, and a page is encrypted and decrypted through it.
#[test]
fn bootstrap_wrap_page_round_trip() {
    let tmp = NamedTempFile::new().unwrap();
    let mut keyring = FileKeyring::empty();
    keyring.save_as(tmp.path()).unwrap();

    let mut mgr = MasterKeyManager::new(keyring, "INNODBKey");
    let (master_key_id, master_key, uuid) =
        resolve_encode_master_key(&mut mgr, false, SERVER_UUID).unwrap();
    assert_eq!(master_key_id, 1);
    assert_eq!(uuid, SERVER_UUID);

    let tablespace_key = [0x77u8; 32];
    let tablespace_iv = [0x88u8; 32];
    let blob = encode_info(
        &tablespace_key,
        &tablespace_iv,
        master_key_id,
        &master_key,
        &uuid,
        true,
    )
    .unwrap();
    assert_eq!(blob.len(), ENCRYPTION_INFO_SIZE);

    // Re-open: reload the keyring from disk into a fresh manager and
    // decode the blob as a recovering process would.
    let reloaded = FileKeyring::load(tmp.path()).unwrap();
    let reopened_mgr = MasterKeyManager::new(reloaded, "INNODBKey");
    let decoded = decode_info(&blob, &reopened_mgr, true).unwrap().unwrap();
    assert_eq!(decoded.key, tablespace_key);
    assert_eq!(decoded.iv, tablespace_iv);
    assert_eq!(decoded.master_key_id, master_key_id);
    assert_eq!(decoded.server_uuid, uuid);

    let ctx = EncryptionContext::new(
        EncryptionMode::Aes,
        decoded.key,
        decoded.iv,
        0,
        decoded.master_key_id,
        decoded.server_uuid,
    );

    let page = sample_page(PageType::Index.as_u16());
    let mut cipher = vec![0u8; PAGE_SIZE];
    encrypt_page(&ctx, &page, &mut cipher).unwrap();
    let mut plain = vec![0u8; PAGE_SIZE];
    decrypt_page(&ctx, &cipher, &mut plain).unwrap();
    assert_eq!(plain, page);
}

/// Rotating the master key advances the process-wide id without
/// disturbing a tablespace's own key material; the new blob still
/// decodes to the same key.
#[test]
fn rotation_then_rewrap_preserves_tablespace_key() {
    let mut mgr = MasterKeyManager::new(FileKeyring::empty(), "INNODBKey");
    let (old_id, old_master_key, uuid) =
        resolve_encode_master_key(&mut mgr, false, SERVER_UUID).unwrap();

    let tablespace_key = [0x11u8; 32];
    let tablespace_iv = [0x22u8; 32];
    let old_blob = encode_info(&tablespace_key, &tablespace_iv, old_id, &old_master_key, &uuid, true).unwrap();

    let new_id = mgr.rotate(SERVER_UUID).unwrap();
    assert_eq!(new_id, old_id + 1);
    let (_, new_master_key) = mgr.get_or_create_master_key(SERVER_UUID).unwrap();
    let new_blob = encode_info(&tablespace_key, &tablespace_iv, new_id, &new_master_key, SERVER_UUID, true).unwrap();

    let decoded_old = decode_info(&old_blob, &mgr, true).unwrap().unwrap();
    let decoded_new = decode_info(&new_blob, &mgr, true).unwrap().unwrap();
    assert_eq!(decoded_old.key, tablespace_key);
    assert_eq!(decoded_new.key, tablespace_key);
    assert_eq!(decoded_new.master_key_id, new_id);
}

/// Redo log key-version recovery: a block written under an older keyring
/// version is still readable once the log block's own RK_V2 info record
/// has told the reader which key to ask the keyring for.
#[test]
fn redo_log_info_record_and_block_round_trip() {
    let old_ctx = EncryptionContext::new(EncryptionMode::Keyring, [0x33u8; 32], [0x44u8; 32], 2, 0, SERVER_UUID.to_string());

    let info = RedoLogEncryptionInfo::new(old_ctx.key_version, SERVER_UUID, old_ctx.iv);
    let info_blob = info.encode();
    let decoded = RedoLogEncryptionInfo::decode(&info_blob).unwrap();
    assert_eq!(decoded.key_version, 2);
    assert_eq!(decoded.server_uuid, SERVER_UUID);

    let mut block = vec![0u8; LOG_BLOCK_SIZE];
    for (i, b) in block.iter_mut().enumerate() {
        *b = (i % 200) as u8;
    }
    let mut cipher = vec![0u8; LOG_BLOCK_SIZE];
    encrypt_log(&old_ctx, &block, &mut cipher).unwrap();

    let new_ctx = EncryptionContext::new(EncryptionMode::Keyring, [0x99u8; 32], old_ctx.iv, 3, 0, SERVER_UUID.to_string());
    struct OneKeyResolver([u8; 32]);
    impl idb::innodb::cryptor::RedoLogKeyResolver for OneKeyResolver {
        fn key_for_version(&self, _version: u32) -> Result<[u8; 32], idb::IdbError> {
            Ok(self.0)
        }
    }
    let resolver = OneKeyResolver(old_ctx.key);

    let mut plain = vec![0u8; LOG_BLOCK_SIZE];
    decrypt_log(&new_ctx, &cipher, &mut plain, Some(&resolver)).unwrap();
    assert_eq!(plain, block);
}


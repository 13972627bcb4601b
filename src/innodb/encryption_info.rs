//! Encryption Info Codec: the per-tablespace encryption metadata blob
//! stored in page 0, plus the redo-log keyring variant.
//!
//! Three page-0 blob versions must be parseable (V1, V2, V3); V3 is the
//! only format new writes emit. A separate fixed-length RK_V2 format
//! carries the same kind of metadata for redo log keyring mode.

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use aes::Aes256;
use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;

use crate::innodb::constants::*;
use crate::innodb::master_key::MasterKeyManager;
use crate::innodb::keyring::KeyringGateway;
use crate::IdbError;

type Aes256EcbEnc = ecb::Encryptor<Aes256>;
type Aes256EcbDec = ecb::Decryptor<Aes256>;

/// Detect tablespace-level AES encryption from FSP space flags (bit 13).
///
/// # Examples
///
/// ```
/// use idb::innodb::encryption_info::is_encrypted;
///
/// assert!(!is_encrypted(0));
/// assert!(is_encrypted(1 << 13));
/// ```
pub fn is_encrypted(fsp_flags: u32) -> bool {
    (fsp_flags >> 13) & 0x01 != 0
}

/// Parsed encryption info from page 0 of an encrypted tablespace.
#[derive(Debug, Clone, Serialize)]
pub struct EncryptionInfo {
    /// Encryption info version (1 = `lCA`, 2 = `lCB`, 3 = `lCC`).
    pub magic_version: u8,
    /// Master key ID from the keyring.
    pub master_key_id: u32,
    /// Server UUID string (36 ASCII characters); empty for V1.
    pub server_uuid: String,
    /// Wrapped tablespace key (32 bytes) + IV (32 bytes), AES-256-ECB.
    #[serde(skip)]
    pub encrypted_key_iv: [u8; 64],
    /// CRC32 checksum of the plaintext key+IV.
    pub checksum: u32,
}

/// Compute the number of pages per extent for a given page size.
pub fn pages_per_extent(page_size: u32) -> u32 {
    if page_size <= 16384 {
        1048576 / page_size
    } else {
        64
    }
}

/// Compute the number of XDES entries on page 0 for a given page size.
pub fn xdes_arr_size(page_size: u32) -> u32 {
    page_size / pages_per_extent(page_size)
}

/// Compute the byte offset of the encryption info on page 0.
///
/// Layout: FIL_PAGE_DATA(38) + FSP_HEADER(112) + XDES_ARRAY(entries * 40)
///
/// # Examples
///
/// ```
/// use idb::innodb::encryption_info::encryption_info_offset;
///
/// assert_eq!(encryption_info_offset(16384), 10390);
/// assert_eq!(encryption_info_offset(4096), 790);
/// ```
pub fn encryption_info_offset(page_size: u32) -> usize {
    let xdes_arr_offset = FIL_PAGE_DATA + FSP_HEADER_SIZE;
    let xdes_entries = xdes_arr_size(page_size) as usize;
    xdes_arr_offset + xdes_entries * XDES_SIZE
}

/// Parse encryption info from page 0 of a tablespace, locating it via
/// [`encryption_info_offset`]. Returns `None` if no recognized magic is
/// present at the expected offset.
pub fn parse_encryption_info(page0: &[u8], page_size: u32) -> Option<EncryptionInfo> {
    let offset = encryption_info_offset(page_size);

    if page0.len() < offset + ENCRYPTION_INFO_SIZE {
        return None;
    }

    let magic = &page0[offset..offset + ENCRYPTION_MAGIC_SIZE];
    let magic_version = if magic == ENCRYPTION_MAGIC_V1 {
        1
    } else if magic == ENCRYPTION_MAGIC_V2 {
        2
    } else if magic == ENCRYPTION_MAGIC_V3 {
        3
    } else {
        return None;
    };

    let master_key_id = BigEndian::read_u32(&page0[offset + 3..]);
    let uuid_bytes = &page0[offset + 7..offset + 7 + ENCRYPTION_SERVER_UUID_LEN];
    let server_uuid = String::from_utf8_lossy(uuid_bytes).to_string();

    let mut encrypted_key_iv = [0u8; 64];
    encrypted_key_iv.copy_from_slice(&page0[offset + 43..offset + 43 + 64]);

    let checksum = BigEndian::read_u32(&page0[offset + 107..]);

    Some(EncryptionInfo {
        magic_version,
        master_key_id,
        server_uuid,
        encrypted_key_iv,
        checksum,
    })
}

/// Resolve which master key an encode should wrap the tablespace key
/// under: the hard-coded bootstrap key when `is_bootstrap` is set or no
/// server uuid is available yet, otherwise the process's current (or
/// lazily-created) master key.
pub fn resolve_encode_master_key<G: KeyringGateway>(
    mgr: &mut MasterKeyManager<G>,
    is_bootstrap: bool,
    server_uuid: &str,
) -> Result<(u32, [u8; 32], String), IdbError> {
    if is_bootstrap || server_uuid.is_empty() {
        Ok((DEFAULT_MASTER_KEY_ID, DEFAULT_MASTER_KEY, String::new()))
    } else {
        let (id, key) = mgr.get_or_create_master_key(server_uuid)?;
        Ok((id, key, server_uuid.to_string()))
    }
}

/// Encode a V3 encryption info blob: `{"lCC" | master_key_id | server_uuid
/// | wrapped(key‖iv) | crc32(plaintext key‖iv)}`, 111 bytes.
///
/// If `encrypt_key` is false, the key‖iv region is copied plaintext
/// instead of AES-256-ECB wrapped (used only by clone operations that
/// preserve an already-decrypted context verbatim).
pub fn encode_info(
    key: &[u8; 32],
    iv: &[u8; 32],
    master_key_id: u32,
    master_key: &[u8; 32],
    server_uuid: &str,
    encrypt_key: bool,
) -> Result<Vec<u8>, IdbError> {
    let mut plaintext = [0u8; 64];
    plaintext[..32].copy_from_slice(key);
    plaintext[32..].copy_from_slice(iv);
    let crc = crc32c::crc32c(&plaintext);

    let mut wrapped = plaintext;
    if encrypt_key {
        let encryptor = Aes256EcbEnc::new_from_slice(master_key)
            .map_err(|e| IdbError::EncryptFail(format!("AES-256-ECB init failed: {}", e)))?;
        encryptor
            .encrypt_padded_mut::<NoPadding>(&mut wrapped, 64)
            .map_err(|e| IdbError::EncryptFail(format!("AES-256-ECB wrap failed: {}", e)))?;
    }

    let mut blob = Vec::with_capacity(ENCRYPTION_INFO_SIZE);
    blob.extend_from_slice(ENCRYPTION_MAGIC_V3);
    let mut id_buf = [0u8; 4];
    BigEndian::write_u32(&mut id_buf, master_key_id);
    blob.extend_from_slice(&id_buf);
    let mut uuid_buf = [0u8; ENCRYPTION_SERVER_UUID_LEN];
    let uuid_bytes = server_uuid.as_bytes();
    let n = uuid_bytes.len().min(ENCRYPTION_SERVER_UUID_LEN);
    uuid_buf[..n].copy_from_slice(&uuid_bytes[..n]);
    blob.extend_from_slice(&uuid_buf);
    blob.extend_from_slice(&wrapped);
    let mut crc_buf = [0u8; 4];
    BigEndian::write_u32(&mut crc_buf, crc);
    blob.extend_from_slice(&crc_buf);

    Ok(blob)
}

/// Result of decoding an encryption info blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInfo {
    /// Recovered tablespace key.
    pub key: [u8; 32],
    /// Recovered tablespace IV.
    pub iv: [u8; 32],
    /// Master key id the blob was wrapped under.
    pub master_key_id: u32,
    /// Server uuid the blob was wrapped under (empty for V1).
    pub server_uuid: String,
}

/// Decode an encryption info blob of any supported version.
///
/// Returns `Ok(None)` for a wholly unrecognized magic — during recovery
/// this means "not flushed yet", not corruption. Returns
/// `Err(InfoCorrupt)` only once a magic is recognized but the CRC check
/// over the decrypted key‖iv fails.
///
/// On success with `master_key_id` newer than what `mgr` has seen, the
/// process-wide id is advanced (catch-up after restart).
pub fn decode_info<G: KeyringGateway>(
    blob: &[u8],
    mgr: &MasterKeyManager<G>,
    decrypt_key: bool,
) -> Result<Option<DecodedInfo>, IdbError> {
    if blob.len() < ENCRYPTION_MAGIC_SIZE {
        return Ok(None);
    }
    let magic = &blob[..ENCRYPTION_MAGIC_SIZE];

    if magic == ENCRYPTION_MAGIC_V1 {
        decode_v1(blob, mgr, decrypt_key)
    } else if magic == ENCRYPTION_MAGIC_V2 {
        decode_v2_or_v3(blob, mgr, decrypt_key, 2)
    } else if magic == ENCRYPTION_MAGIC_V3 {
        decode_v2_or_v3(blob, mgr, decrypt_key, 3)
    } else {
        Ok(None)
    }
}

fn decode_v1<G: KeyringGateway>(
    blob: &[u8],
    mgr: &MasterKeyManager<G>,
    decrypt_key: bool,
) -> Result<Option<DecodedInfo>, IdbError> {
    let legacy_padded = blob.len() >= ENCRYPTION_INFO_SIZE_V1_LEGACY;
    let (id_end, wrapped_start) = if legacy_padded {
        (ENCRYPTION_MAGIC_SIZE + 4, ENCRYPTION_MAGIC_SIZE + 8)
    } else {
        (ENCRYPTION_MAGIC_SIZE + 4, ENCRYPTION_MAGIC_SIZE + 4)
    };
    if blob.len() < wrapped_start + ENCRYPTION_KEY_IV_LEN + 4 {
        return Ok(None);
    }
    let master_key_id = BigEndian::read_u32(&blob[ENCRYPTION_MAGIC_SIZE..id_end]);
    let wrapped = &blob[wrapped_start..wrapped_start + ENCRYPTION_KEY_IV_LEN];
    let stored_crc = BigEndian::read_u32(&blob[wrapped_start + ENCRYPTION_KEY_IV_LEN..]);

    let master_key = mgr.get_master_key(master_key_id, None)?;
    finish_decode(wrapped, stored_crc, master_key_id, "", &master_key, decrypt_key).map(Some)
}

fn decode_v2_or_v3<G: KeyringGateway>(
    blob: &[u8],
    mgr: &MasterKeyManager<G>,
    decrypt_key: bool,
    version: u8,
) -> Result<Option<DecodedInfo>, IdbError> {
    if blob.len() < ENCRYPTION_INFO_SIZE {
        return Ok(None);
    }
    let master_key_id = BigEndian::read_u32(&blob[ENCRYPTION_MAGIC_SIZE..]);
    let uuid_start = ENCRYPTION_MAGIC_SIZE + 4;
    let uuid_bytes = &blob[uuid_start..uuid_start + ENCRYPTION_SERVER_UUID_LEN];
    let server_uuid = String::from_utf8_lossy(uuid_bytes).trim_end_matches('\0').to_string();
    let wrapped_start = uuid_start + ENCRYPTION_SERVER_UUID_LEN;
    let wrapped = &blob[wrapped_start..wrapped_start + ENCRYPTION_KEY_IV_LEN];
    let stored_crc = BigEndian::read_u32(&blob[wrapped_start + ENCRYPTION_KEY_IV_LEN..]);

    let master_key = if version == 3 && master_key_id == DEFAULT_MASTER_KEY_ID {
        DEFAULT_MASTER_KEY
    } else {
        mgr.get_master_key(master_key_id, Some(&server_uuid))?
    };

    let decoded = finish_decode(wrapped, stored_crc, master_key_id, &server_uuid, &master_key, decrypt_key)?;
    if decoded.master_key_id > mgr.current_id() {
        mgr.catch_up(decoded.master_key_id, &decoded.server_uuid);
    }
    Ok(Some(decoded))
}

fn finish_decode(
    wrapped: &[u8],
    stored_crc: u32,
    master_key_id: u32,
    server_uuid: &str,
    master_key: &[u8; 32],
    decrypt_key: bool,
) -> Result<DecodedInfo, IdbError> {
    let mut plaintext = [0u8; 64];
    plaintext.copy_from_slice(wrapped);

    if decrypt_key {
        let decryptor = Aes256EcbDec::new_from_slice(master_key)
            .map_err(|e| IdbError::DecryptFail(format!("AES-256-ECB init failed: {}", e)))?;
        decryptor
            .decrypt_padded_mut::<NoPadding>(&mut plaintext)
            .map_err(|e| IdbError::DecryptFail(format!("AES-256-ECB unwrap failed: {}", e)))?;
    }

    let computed_crc = crc32c::crc32c(&plaintext);
    if computed_crc != stored_crc {
        return Err(IdbError::InfoCorrupt(format!(
            "CRC32 mismatch decoding encryption info (computed=0x{:08X}, stored=0x{:08X})",
            computed_crc, stored_crc
        )));
    }

    let mut key = [0u8; 32];
    let mut iv = [0u8; 32];
    key.copy_from_slice(&plaintext[..32]);
    iv.copy_from_slice(&plaintext[32..]);

    Ok(DecodedInfo {
        key,
        iv,
        master_key_id,
        server_uuid: server_uuid.to_string(),
    })
}

/// Redo-log keyring encryption info (magic `lRK`): `{magic | key_version
/// | server_uuid | iv | crc32}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedoLogEncryptionInfo {
    /// Keyring key version the log was encrypted under.
    pub key_version: u32,
    /// Server uuid.
    pub server_uuid: String,
    /// 32-byte IV.
    pub iv: [u8; 32],
    /// CRC32 of `key_version || server_uuid || iv`.
    pub checksum: u32,
}

impl RedoLogEncryptionInfo {
    /// Encode to its fixed-length on-disk form.
    pub fn encode(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(
            ENCRYPTION_MAGIC_SIZE + 4 + ENCRYPTION_SERVER_UUID_LEN + 32 + 4,
        );
        blob.extend_from_slice(ENCRYPTION_MAGIC_RK_V2);
        let mut ver_buf = [0u8; 4];
        BigEndian::write_u32(&mut ver_buf, self.key_version);
        blob.extend_from_slice(&ver_buf);
        let mut uuid_buf = [0u8; ENCRYPTION_SERVER_UUID_LEN];
        let uuid_bytes = self.server_uuid.as_bytes();
        let n = uuid_bytes.len().min(ENCRYPTION_SERVER_UUID_LEN);
        uuid_buf[..n].copy_from_slice(&uuid_bytes[..n]);
        blob.extend_from_slice(&uuid_buf);
        blob.extend_from_slice(&self.iv);
        let mut crc_buf = [0u8; 4];
        BigEndian::write_u32(&mut crc_buf, self.checksum);
        blob.extend_from_slice(&crc_buf);
        blob
    }

    /// Build (and checksum) a new instance for encoding.
    pub fn new(key_version: u32, server_uuid: &str, iv: [u8; 32]) -> Self {
        let mut buf = Vec::with_capacity(4 + ENCRYPTION_SERVER_UUID_LEN + 32);
        let mut ver_buf = [0u8; 4];
        BigEndian::write_u32(&mut ver_buf, key_version);
        buf.extend_from_slice(&ver_buf);
        let mut uuid_buf = [0u8; ENCRYPTION_SERVER_UUID_LEN];
        let uuid_bytes = server_uuid.as_bytes();
        let n = uuid_bytes.len().min(ENCRYPTION_SERVER_UUID_LEN);
        uuid_buf[..n].copy_from_slice(&uuid_bytes[..n]);
        buf.extend_from_slice(&uuid_buf);
        buf.extend_from_slice(&iv);
        let checksum = crc32c::crc32c(&buf);
        RedoLogEncryptionInfo {
            key_version,
            server_uuid: server_uuid.to_string(),
            iv,
            checksum,
        }
    }

    /// Decode from its fixed-length on-disk form. Returns `None` if the
    /// magic does not match or the blob is too short.
    pub fn decode(blob: &[u8]) -> Option<Self> {
        let expected_len = ENCRYPTION_MAGIC_SIZE + 4 + ENCRYPTION_SERVER_UUID_LEN + 32 + 4;
        if blob.len() < expected_len || &blob[..ENCRYPTION_MAGIC_SIZE] != ENCRYPTION_MAGIC_RK_V2 {
            return None;
        }
        let mut offset = ENCRYPTION_MAGIC_SIZE;
        let key_version = BigEndian::read_u32(&blob[offset..]);
        offset += 4;
        let server_uuid = String::from_utf8_lossy(&blob[offset..offset + ENCRYPTION_SERVER_UUID_LEN])
            .trim_end_matches('\0')
            .to_string();
        offset += ENCRYPTION_SERVER_UUID_LEN;
        let mut iv = [0u8; 32];
        iv.copy_from_slice(&blob[offset..offset + 32]);
        offset += 32;
        let checksum = BigEndian::read_u32(&blob[offset..]);

        Some(RedoLogEncryptionInfo {
            key_version,
            server_uuid,
            iv,
            checksum,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::innodb::keyring::InMemoryKeyring;

    #[test]
    fn test_is_encrypted() {
        assert!(!is_encrypted(0));
        assert!(is_encrypted(1 << 13));
        assert!(!is_encrypted(0xFF));
    }

    #[test]
    fn test_encryption_info_offset_16k() {
        assert_eq!(encryption_info_offset(16384), 10390);
    }

    #[test]
    fn test_encryption_info_offset_various() {
        assert_eq!(encryption_info_offset(4096), 38 + 112 + 16 * 40);
        assert_eq!(encryption_info_offset(8192), 38 + 112 + 64 * 40);
        assert_eq!(encryption_info_offset(32768), 38 + 112 + 512 * 40);
    }

    #[test]
    fn test_parse_encryption_info_v3() {
        let mut page = vec![0u8; 16384];
        let offset = encryption_info_offset(16384);
        page[offset..offset + 3].copy_from_slice(b"lCC");
        BigEndian::write_u32(&mut page[offset + 3..], 42);
        let uuid = "12345678-1234-1234-1234-123456789abc";
        page[offset + 7..offset + 7 + 36].copy_from_slice(uuid.as_bytes());
        for i in 0..64 {
            page[offset + 43 + i] = i as u8;
        }
        BigEndian::write_u32(&mut page[offset + 107..], 0xDEADBEEF);

        let info = parse_encryption_info(&page, 16384).unwrap();
        assert_eq!(info.magic_version, 3);
        assert_eq!(info.master_key_id, 42);
        assert_eq!(info.server_uuid, uuid);
        assert_eq!(info.checksum, 0xDEADBEEF);
    }

    #[test]
    fn test_parse_encryption_info_no_magic() {
        let page = vec![0u8; 16384];
        assert!(parse_encryption_info(&page, 16384).is_none());
    }

    #[test]
    fn test_encode_decode_roundtrip_v3() {
        let mut mgr = MasterKeyManager::new(InMemoryKeyring::new(), "INNODBKey");
        let (id, master_key, uuid) = resolve_encode_master_key(&mut mgr, false, "uuid-1234").unwrap();

        let key = [0x11u8; 32];
        let iv = [0x22u8; 32];
        let blob = encode_info(&key, &iv, id, &master_key, &uuid, true).unwrap();
        assert_eq!(blob.len(), ENCRYPTION_INFO_SIZE);

        let decoded = decode_info(&blob, &mgr, true).unwrap().unwrap();
        assert_eq!(decoded.key, key);
        assert_eq!(decoded.iv, iv);
        assert_eq!(decoded.master_key_id, id);
    }

    #[test]
    fn test_decode_bootstrap_id_zero_uses_default_key() {
        let mut mgr = MasterKeyManager::new(InMemoryKeyring::new(), "INNODBKey");
        let (id, master_key, uuid) = resolve_encode_master_key(&mut mgr, true, "").unwrap();
        assert_eq!(id, 0);

        let key = [0x33u8; 32];
        let iv = [0x44u8; 32];
        let blob = encode_info(&key, &iv, id, &master_key, &uuid, true).unwrap();
        let decoded = decode_info(&blob, &mgr, true).unwrap().unwrap();
        assert_eq!(decoded.key, key);
        assert_eq!(decoded.iv, iv);
    }

    #[test]
    fn test_crc_bit_flip_rejected() {
        let mut mgr = MasterKeyManager::new(InMemoryKeyring::new(), "INNODBKey");
        let (id, master_key, uuid) = resolve_encode_master_key(&mut mgr, false, "uuid-flip").unwrap();
        let mut blob = encode_info(&[0xAAu8; 32], &[0xBBu8; 32], id, &master_key, &uuid, true).unwrap();

        let first_cipher_byte = ENCRYPTION_MAGIC_SIZE + 4 + ENCRYPTION_SERVER_UUID_LEN;
        blob[first_cipher_byte] ^= 0x01;

        let result = decode_info(&blob, &mgr, true);
        assert!(matches!(result, Err(IdbError::InfoCorrupt(_))));
    }

    #[test]
    fn test_unrecognized_magic_is_noop_not_error() {
        let mgr = MasterKeyManager::new(InMemoryKeyring::new(), "INNODBKey");
        let blob = vec![0u8; ENCRYPTION_INFO_SIZE];
        let result = decode_info(&blob, &mgr, true).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_decode_v1_legacy_padding() {
        let mut keyring = InMemoryKeyring::new();
        keyring.insert("INNODBKey-7-7", vec![0x77u8; 32], "AES");
        let mgr = MasterKeyManager::new(keyring, "INNODBKey").with_legacy_server_id("7");

        let key = [0x55u8; 32];
        let iv = [0x66u8; 32];
        let blob = encode_info(&key, &iv, 7, &[0x77u8; 32], "", true).unwrap();

        // Rebuild as a V1 blob with the legacy 8-byte id padding form.
        let mut v1 = Vec::new();
        v1.extend_from_slice(ENCRYPTION_MAGIC_V1);
        v1.extend_from_slice(&blob[ENCRYPTION_MAGIC_SIZE..ENCRYPTION_MAGIC_SIZE + 4]); // id
        v1.extend_from_slice(&[0u8; 4]); // legacy zero pad
        let wrapped_start_v3 = ENCRYPTION_MAGIC_SIZE + 4 + ENCRYPTION_SERVER_UUID_LEN;
        v1.extend_from_slice(&blob[wrapped_start_v3..]); // wrapped key‖iv + crc

        let decoded = decode_info(&v1, &mgr, true).unwrap().unwrap();
        assert_eq!(decoded.key, key);
        assert_eq!(decoded.iv, iv);
    }

    #[test]
    fn test_redo_log_info_roundtrip() {
        let info = RedoLogEncryptionInfo::new(5, "uuid-redo", [0x99u8; 32]);
        let blob = info.encode();
        let decoded = RedoLogEncryptionInfo::decode(&blob).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_redo_log_info_wrong_magic_rejected() {
        let mut blob = RedoLogEncryptionInfo::new(1, "u", [0u8; 32]).encode();
        blob[0] = b'x';
        assert!(RedoLogEncryptionInfo::decode(&blob).is_none());
    }
}

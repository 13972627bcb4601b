//! Page and redo-log block cryptor.
//!
//! Every byte that crosses the boundary between a data file (or the redo
//! log) and a buffer pool frame passes through here. [`encrypt_page`] and
//! [`decrypt_page`] transform whole InnoDB pages in place using the key
//! material carried by an [`EncryptionContext`]; [`encrypt_log`] and
//! [`decrypt_log`] do the same for 512-byte redo log blocks.
//!
//! Page payloads are rarely a multiple of the AES block size, so the
//! block-aligned prefix is encrypted with ordinary AES-256-CBC and the
//! final partial block is folded in with ciphertext stealing (CBC-CS3)
//! rather than padding, keeping the ciphertext exactly as long as the
//! plaintext.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::cipher::block_padding::NoPadding;
use aes::Aes256;
use byteorder::{BigEndian, ByteOrder};

use crate::innodb::constants::*;
use crate::innodb::context::{EncryptionContext, EncryptionMode};
use crate::innodb::page_types::PageType;
use crate::IdbError;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Resolves the tablespace key for a redo log block whose stamped key
/// version does not match the context's current version. Used by
/// [`decrypt_log`] when reading a block written under an older keyring
/// key before the current one was rotated in.
pub trait RedoLogKeyResolver {
    /// Return the 32-byte key registered for the given keyring version.
    fn key_for_version(&self, version: u32) -> Result<[u8; 32], IdbError>;
}

/// Where in the page the AES cipher actually runs, and how long the run is.
///
/// Computed identically on encrypt and decrypt: every byte before
/// `data_start` (the FIL header, and for compressed pages the compression
/// sub-header plus any keyring reserve) is always plaintext, so a decrypt
/// call can read it from ciphertext before it knows how to size the rest
/// of the region.
struct CryptRegion {
    data_start: usize,
    data_len: usize,
}

fn page_crypt_region(
    header: &[u8],
    page_size: usize,
    is_compressed: bool,
    keyring: bool,
) -> Result<CryptRegion, String> {
    if !is_compressed {
        let data_start = FIL_PAGE_DATA;
        let data_len = page_size - data_start - SIZE_FIL_TRAILER;
        return Ok(CryptRegion { data_start, data_len });
    }

    let stored_len = BigEndian::read_u16(
        &header[FIL_PAGE_DATA + FIL_PAGE_COMPRESSED_SIZE_OFFSET..],
    ) as usize;
    let keyring_reserve = if keyring {
        FIL_PAGE_COMPRESSED_ENCRYPTION_HEADER_SIZE
    } else {
        0
    };
    let data_start = FIL_PAGE_DATA + FIL_PAGE_COMPRESSION_HEADER_SIZE + keyring_reserve;
    let data_len = stored_len.max(MIN_ENCRYPTION_LEN);
    if data_start + data_len + SIZE_FIL_TRAILER > page_size {
        return Err(format!(
            "compressed payload of {data_len} bytes does not fit in a {page_size}-byte page"
        ));
    }
    Ok(CryptRegion { data_start, data_len })
}

/// Encrypt one InnoDB page in place.
///
/// `src` and `dst` must be the same length (the tablespace's page size)
/// and may alias the same buffer only if `src == dst` exactly; passing
/// distinct buffers is the common case (read the clear page, write the
/// cipher page out).
///
/// The low [`FIL_PAGE_DATA`] bytes (FIL header) and the trailing
/// [`SIZE_FIL_TRAILER`] bytes are copied through unencrypted. Everything
/// between is enciphered with AES-256-CBC using `ctx.key`/`ctx.cbc_iv()`,
/// except for the compressed-payload and keyring-mode carve-outs described
/// on [`page_crypt_region`].
pub fn encrypt_page(ctx: &EncryptionContext, src: &[u8], dst: &mut [u8]) -> Result<(), IdbError> {
    if src.len() != dst.len() {
        return Err(IdbError::EncryptFail("src/dst length mismatch".into()));
    }
    let page_size = src.len();
    let page_floor = FIL_PAGE_DATA + SIZE_FIL_TRAILER + 2 * AES_BLOCK_SIZE;
    if page_size < page_floor {
        return Err(IdbError::EncryptFail(format!(
            "page of {page_size} bytes is smaller than the minimum encryptable length"
        )));
    }

    let page_type_raw = BigEndian::read_u16(&src[FIL_PAGE_TYPE..]);
    let page_type = PageType::from_u16(page_type_raw);
    if matches!(
        page_type,
        PageType::Encrypted | PageType::CompressedEncrypted | PageType::EncryptedRtree
    ) {
        return Err(IdbError::InvariantViolation(
            "page is already encrypted".into(),
        ));
    }
    if ctx.mode == EncryptionMode::None {
        return Err(IdbError::UnsupportedMode(
            "context carries no key material (mode is None)".into(),
        ));
    }

    let is_compressed = page_type == PageType::Compressed;
    let keyring = matches!(
        ctx.mode,
        EncryptionMode::Keyring | EncryptionMode::KeyringRotatingFromMaster
    );
    let region = page_crypt_region(src, page_size, is_compressed, keyring)
        .map_err(IdbError::EncryptFail)?;

    dst.copy_from_slice(src);

    let encrypt_start = region.data_start;
    let encrypt_end = region.data_start + region.data_len;
    two_pass_encrypt(&ctx.key, &ctx.cbc_iv(), &mut dst[encrypt_start..encrypt_end])?;

    let new_type = match page_type {
        PageType::Compressed => PageType::CompressedEncrypted,
        PageType::Rtree => PageType::EncryptedRtree,
        _ => PageType::Encrypted,
    };
    if !matches!(page_type, PageType::Compressed) {
        BigEndian::write_u16(&mut dst[FIL_PAGE_ORIGINAL_TYPE_V1..], page_type_raw);
    }
    BigEndian::write_u16(&mut dst[FIL_PAGE_TYPE..], new_type.as_u16());

    if keyring {
        if ctx.key_version == 0 {
            return Err(IdbError::InvariantViolation(
                "keyring mode requires a non-zero key version".into(),
            ));
        }
        BigEndian::write_u32(&mut dst[FIL_PAGE_ENCRYPTION_KEY_VERSION..], ctx.key_version);

        if is_compressed {
            let reserve_start = FIL_PAGE_DATA + FIL_PAGE_COMPRESSION_HEADER_SIZE;
            let checksum = crc32c::crc32c(&dst[encrypt_start..encrypt_end]);
            BigEndian::write_u32(&mut dst[reserve_start..], ctx.key_version);
            BigEndian::write_u32(&mut dst[reserve_start + 4..], checksum);
        }

        match ctx.mode {
            EncryptionMode::KeyringRotatingFromMaster => {
                let checksum = crc32c::crc32c(&dst[encrypt_start..encrypt_end]);
                BigEndian::write_u32(
                    &mut dst[page_size - FIL_PAGE_ENCRYPT_LSN_MIRROR_LEN..],
                    checksum,
                );
            }
            EncryptionMode::Keyring if !is_compressed => {
                let lsn_lo = FIL_PAGE_LSN + 4;
                dst[page_size - FIL_PAGE_ENCRYPT_LSN_MIRROR_LEN..]
                    .copy_from_slice(&src[lsn_lo..lsn_lo + FIL_PAGE_ENCRYPT_LSN_MIRROR_LEN]);
            }
            _ => {}
        }
    }

    Ok(())
}

/// Decrypt one InnoDB page in place.
///
/// If `src`'s page type is not one of the encrypted variants, this is a
/// no-op: `dst` receives an exact copy of `src`. This lets callers run
/// every page read through `decrypt_page` unconditionally.
pub fn decrypt_page(ctx: &EncryptionContext, src: &[u8], dst: &mut [u8]) -> Result<(), IdbError> {
    if src.len() != dst.len() {
        return Err(IdbError::DecryptFail("src/dst length mismatch".into()));
    }
    dst.copy_from_slice(src);

    let page_size = src.len();
    let page_type_raw = BigEndian::read_u16(&src[FIL_PAGE_TYPE..]);
    let page_type = PageType::from_u16(page_type_raw);
    if !matches!(
        page_type,
        PageType::Encrypted | PageType::CompressedEncrypted | PageType::EncryptedRtree
    ) {
        return Ok(());
    }
    if ctx.mode == EncryptionMode::None {
        return Err(IdbError::DecryptFail(
            "page is encrypted but context carries no key material".into(),
        ));
    }

    let is_compressed = page_type == PageType::CompressedEncrypted;
    let keyring = matches!(
        ctx.mode,
        EncryptionMode::Keyring | EncryptionMode::KeyringRotatingFromMaster
    );
    let region = page_crypt_region(src, page_size, is_compressed, keyring)
        .map_err(IdbError::DecryptFail)?;

    let original_type_raw = BigEndian::read_u16(&dst[FIL_PAGE_ORIGINAL_TYPE_V1..]);
    let encrypt_start = region.data_start;
    let encrypt_end = region.data_start + region.data_len;
    two_pass_decrypt(&ctx.key, &ctx.cbc_iv(), &mut dst[encrypt_start..encrypt_end])?;

    let restored_type = if is_compressed {
        PageType::Compressed.as_u16()
    } else {
        original_type_raw
    };
    BigEndian::write_u16(&mut dst[FIL_PAGE_TYPE..], restored_type);

    if keyring {
        BigEndian::write_u32(&mut dst[FIL_PAGE_ENCRYPTION_KEY_VERSION..], 0);

        if is_compressed {
            let reserve_start = FIL_PAGE_DATA + FIL_PAGE_COMPRESSION_HEADER_SIZE;
            BigEndian::write_u32(&mut dst[reserve_start..], 0);
            BigEndian::write_u32(&mut dst[reserve_start + 4..], 0);
        }

        if matches!(ctx.mode, EncryptionMode::Keyring) && !is_compressed {
            let lsn_lo = FIL_PAGE_LSN + 4;
            dst[page_size - FIL_PAGE_ENCRYPT_LSN_MIRROR_LEN..]
                .copy_from_slice(&src[lsn_lo..lsn_lo + FIL_PAGE_ENCRYPT_LSN_MIRROR_LEN]);
        }
    }

    Ok(())
}

/// Encrypt one 512-byte redo log block in place.
///
/// The [`LOG_BLOCK_HDR_SIZE`]-byte header and [`LOG_BLOCK_TRL_SIZE`]-byte
/// trailer are left untouched except for the encrypted-bit flag in the
/// header and the checksum word in the trailer, which is rewritten. In
/// keyring mode the checksum is stamped with the key version so a reader
/// can recover which version encrypted the block without consulting any
/// side channel: `checksum = crc32c(ciphertext) + key_version`.
pub fn encrypt_log(ctx: &EncryptionContext, src: &[u8], dst: &mut [u8]) -> Result<(), IdbError> {
    if src.len() != LOG_BLOCK_SIZE || dst.len() != LOG_BLOCK_SIZE {
        return Err(IdbError::EncryptFail(format!(
            "log block must be exactly {LOG_BLOCK_SIZE} bytes"
        )));
    }
    if ctx.mode == EncryptionMode::None {
        return Err(IdbError::UnsupportedMode(
            "context carries no key material (mode is None)".into(),
        ));
    }

    let header = BigEndian::read_u32(&src[LOG_BLOCK_HDR_NO..]);
    if header & LOG_BLOCK_ENCRYPT_BIT_MASK != 0 {
        return Err(IdbError::InvariantViolation(
            "log block is already encrypted".into(),
        ));
    }

    dst.copy_from_slice(src);

    let payload = &mut dst[LOG_BLOCK_HDR_SIZE..LOG_BLOCK_CHECKSUM_OFFSET];
    cbc_encrypt_aligned(&ctx.key, &ctx.cbc_iv(), payload)?;

    BigEndian::write_u32(
        &mut dst[LOG_BLOCK_HDR_NO..],
        header | LOG_BLOCK_ENCRYPT_BIT_MASK,
    );

    let cipher_crc = crc32c::crc32c(&dst[LOG_BLOCK_HDR_SIZE..LOG_BLOCK_CHECKSUM_OFFSET]);
    let stamped = if matches!(
        ctx.mode,
        EncryptionMode::Keyring | EncryptionMode::KeyringRotatingFromMaster
    ) {
        cipher_crc.wrapping_add(ctx.key_version)
    } else {
        cipher_crc
    };
    BigEndian::write_u32(&mut dst[LOG_BLOCK_CHECKSUM_OFFSET..], stamped);

    Ok(())
}

/// Decrypt one 512-byte redo log block in place.
///
/// Blocks without the encrypted bit set pass through unchanged. In
/// keyring mode, if the version recovered from the checksum does not
/// match `ctx.key_version`, `resolver` is asked for the key registered
/// under that older version so the block can still be read after a
/// rotation.
pub fn decrypt_log(
    ctx: &EncryptionContext,
    src: &[u8],
    dst: &mut [u8],
    resolver: Option<&dyn RedoLogKeyResolver>,
) -> Result<(), IdbError> {
    if src.len() != LOG_BLOCK_SIZE || dst.len() != LOG_BLOCK_SIZE {
        return Err(IdbError::DecryptFail(format!(
            "log block must be exactly {LOG_BLOCK_SIZE} bytes"
        )));
    }
    dst.copy_from_slice(src);

    let header = BigEndian::read_u32(&src[LOG_BLOCK_HDR_NO..]);
    if header & LOG_BLOCK_ENCRYPT_BIT_MASK == 0 {
        return Ok(());
    }
    if ctx.mode == EncryptionMode::None {
        return Err(IdbError::DecryptFail(
            "log block is encrypted but context carries no key material".into(),
        ));
    }

    let key = if matches!(
        ctx.mode,
        EncryptionMode::Keyring | EncryptionMode::KeyringRotatingFromMaster
    ) {
        let stored = BigEndian::read_u32(&src[LOG_BLOCK_CHECKSUM_OFFSET..]);
        let cipher_crc = crc32c::crc32c(&src[LOG_BLOCK_HDR_SIZE..LOG_BLOCK_CHECKSUM_OFFSET]);
        let written_version = stored.wrapping_sub(cipher_crc);
        if written_version == ctx.key_version {
            ctx.key
        } else {
            let resolver = resolver.ok_or_else(|| {
                IdbError::UnsupportedMode(format!(
                    "log block was encrypted under key version {written_version}, \
                     context is at version {}, and no resolver was supplied",
                    ctx.key_version
                ))
            })?;
            resolver.key_for_version(written_version)?
        }
    } else {
        ctx.key
    };

    let payload = &mut dst[LOG_BLOCK_HDR_SIZE..LOG_BLOCK_CHECKSUM_OFFSET];
    cbc_decrypt_aligned(&key, &ctx.cbc_iv(), payload)?;

    BigEndian::write_u32(
        &mut dst[LOG_BLOCK_HDR_NO..],
        header & !LOG_BLOCK_ENCRYPT_BIT_MASK,
    );
    let canonical_crc = crc32c::crc32c(&dst[LOG_BLOCK_HDR_SIZE..LOG_BLOCK_CHECKSUM_OFFSET]);
    BigEndian::write_u32(&mut dst[LOG_BLOCK_CHECKSUM_OFFSET..], canonical_crc);

    Ok(())
}

/// Encrypt a region whose length need not be a multiple of the AES block
/// size: the block-aligned prefix is encrypted with plain CBC, and any
/// trailing partial block is folded into the final block via ciphertext
/// stealing so the region's length is preserved exactly.
fn two_pass_encrypt(key: &[u8; 32], iv: &[u8; 16], region: &mut [u8]) -> Result<(), IdbError> {
    let len = region.len();
    if len < 2 * AES_BLOCK_SIZE {
        return Err(IdbError::EncryptFail(
            "region too short for the two-pass cryptor".into(),
        ));
    }
    let chunk_len = (len / AES_BLOCK_SIZE) * AES_BLOCK_SIZE;
    let rem = len - chunk_len;

    if rem == 0 {
        return cbc_encrypt_aligned(key, iv, region);
    }

    let tail_start = chunk_len - AES_BLOCK_SIZE;
    if tail_start > 0 {
        cbc_encrypt_aligned(key, iv, &mut region[..tail_start])?;
    }
    let second_iv: [u8; AES_BLOCK_SIZE] = if tail_start == 0 {
        *iv
    } else {
        region[tail_start - AES_BLOCK_SIZE..tail_start]
            .try_into()
            .unwrap()
    };

    let cipher = Aes256::new_from_slice(key)
        .map_err(|e| IdbError::EncryptFail(format!("bad key length: {e}")))?;
    cts_encrypt(&cipher, second_iv, &mut region[tail_start..len], rem);
    Ok(())
}

/// Mirror of [`two_pass_encrypt`].
fn two_pass_decrypt(key: &[u8; 32], iv: &[u8; 16], region: &mut [u8]) -> Result<(), IdbError> {
    let len = region.len();
    if len < 2 * AES_BLOCK_SIZE {
        return Err(IdbError::DecryptFail(
            "region too short for the two-pass cryptor".into(),
        ));
    }
    let chunk_len = (len / AES_BLOCK_SIZE) * AES_BLOCK_SIZE;
    let rem = len - chunk_len;

    if rem == 0 {
        return cbc_decrypt_aligned(key, iv, region);
    }

    let tail_start = chunk_len - AES_BLOCK_SIZE;
    // Capture the chaining block before the prefix decrypt overwrites it.
    let second_iv: [u8; AES_BLOCK_SIZE] = if tail_start == 0 {
        *iv
    } else {
        region[tail_start - AES_BLOCK_SIZE..tail_start]
            .try_into()
            .unwrap()
    };

    let cipher = Aes256::new_from_slice(key)
        .map_err(|e| IdbError::DecryptFail(format!("bad key length: {e}")))?;
    cts_decrypt(&cipher, second_iv, &mut region[tail_start..len], rem);

    if tail_start > 0 {
        cbc_decrypt_aligned(key, iv, &mut region[..tail_start])?;
    }
    Ok(())
}

fn cbc_encrypt_aligned(key: &[u8; 32], iv: &[u8; 16], data: &mut [u8]) -> Result<(), IdbError> {
    let len = data.len();
    let enc = Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|e| IdbError::EncryptFail(format!("bad key/iv length: {e}")))?;
    enc.encrypt_padded_mut::<NoPadding>(data, len)
        .map_err(|e| IdbError::EncryptFail(format!("CBC encrypt failed: {e}")))?;
    Ok(())
}

fn cbc_decrypt_aligned(key: &[u8; 32], iv: &[u8; 16], data: &mut [u8]) -> Result<(), IdbError> {
    let dec = Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|e| IdbError::DecryptFail(format!("bad key/iv length: {e}")))?;
    dec.decrypt_padded_mut::<NoPadding>(data)
        .map_err(|e| IdbError::DecryptFail(format!("CBC decrypt failed: {e}")))?;
    Ok(())
}

/// CBC-CS3 ciphertext stealing over the final full block `window[..16]`
/// plus the trailing partial block `window[16..16+rem]`, chained from
/// `iv`. See the module doc comment; the algebra is the textbook CS3
/// construction with the output blocks kept in their original order.
fn cts_encrypt(cipher: &Aes256, iv: [u8; 16], window: &mut [u8], rem: usize) {
    debug_assert_eq!(window.len(), AES_BLOCK_SIZE + rem);

    let mut e_prev: aes::Block = aes::Block::clone_from_slice(&window[..AES_BLOCK_SIZE]);
    for i in 0..AES_BLOCK_SIZE {
        e_prev[i] ^= iv[i];
    }
    cipher.encrypt_block(&mut e_prev);

    let mut d = aes::Block::default();
    d[..rem].copy_from_slice(&window[AES_BLOCK_SIZE..AES_BLOCK_SIZE + rem]);
    for i in 0..AES_BLOCK_SIZE {
        d[i] ^= e_prev[i];
    }
    let mut c_prev = d;
    cipher.encrypt_block(&mut c_prev);

    window[AES_BLOCK_SIZE..AES_BLOCK_SIZE + rem].copy_from_slice(&e_prev[..rem]);
    window[..AES_BLOCK_SIZE].copy_from_slice(&c_prev);
}

/// Mirror of [`cts_encrypt`].
fn cts_decrypt(cipher: &Aes256, iv: [u8; 16], window: &mut [u8], rem: usize) {
    debug_assert_eq!(window.len(), AES_BLOCK_SIZE + rem);

    let c_prev: aes::Block = aes::Block::clone_from_slice(&window[..AES_BLOCK_SIZE]);
    let cn = window[AES_BLOCK_SIZE..AES_BLOCK_SIZE + rem].to_vec();

    let mut dn = c_prev;
    cipher.decrypt_block(&mut dn);

    let mut e_prev = aes::Block::default();
    e_prev[..rem].copy_from_slice(&cn);
    e_prev[rem..].copy_from_slice(&dn[rem..]);

    let mut pn = vec![0u8; rem];
    for i in 0..rem {
        pn[i] = dn[i] ^ cn[i];
    }

    let mut p_prev = e_prev;
    cipher.decrypt_block(&mut p_prev);
    for i in 0..AES_BLOCK_SIZE {
        p_prev[i] ^= iv[i];
    }

    window[..AES_BLOCK_SIZE].copy_from_slice(&p_prev);
    window[AES_BLOCK_SIZE..AES_BLOCK_SIZE + rem].copy_from_slice(&pn);
}

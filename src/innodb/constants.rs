//! InnoDB page and file structure constants.
//!
//! These values are derived from the MySQL/InnoDB source code headers:
//! - `fil0fil.h` (FIL header/trailer)
//! - `page0page.h` (page header)
//! - `fsp0fsp.h` (FSP header)

// ── Page sizes ──────────────────────────────────────────────────────

/// Default InnoDB page size (16 KiB).
pub const SIZE_PAGE_DEFAULT: u32 = 16384;
/// 4 KiB page size.
pub const SIZE_PAGE_4K: u32 = 4096;
/// 8 KiB page size.
pub const SIZE_PAGE_8K: u32 = 8192;
/// 16 KiB page size.
pub const SIZE_PAGE_16K: u32 = 16384;
/// 32 KiB page size.
pub const SIZE_PAGE_32K: u32 = 32768;
/// 64 KiB page size.
pub const SIZE_PAGE_64K: u32 = 65536;

// ── FIL Header (38 bytes total) ─────────────────────────────────────

/// Size of the FIL header in bytes.
pub const SIZE_FIL_HEAD: usize = 38;
/// Offset of the checksum (or space id in older formats). 4 bytes.
pub const FIL_PAGE_SPACE_OR_CHKSUM: usize = 0;
/// Offset of the page number within the tablespace. 4 bytes.
pub const FIL_PAGE_OFFSET: usize = 4;
/// Offset of the previous page pointer. 4 bytes.
pub const FIL_PAGE_PREV: usize = 8;
/// Offset of the next page pointer. 4 bytes.
pub const FIL_PAGE_NEXT: usize = 12;
/// Offset of the LSN of newest modification. 8 bytes.
pub const FIL_PAGE_LSN: usize = 16;
/// Offset of the page type field. 2 bytes.
pub const FIL_PAGE_TYPE: usize = 24;
/// Offset of the flush LSN (only page 0 of system tablespace). 8 bytes.
pub const FIL_PAGE_FILE_FLUSH_LSN: usize = 26;
/// Offset of the space ID. 4 bytes.
pub const FIL_PAGE_SPACE_ID: usize = 34;

// ── FIL Trailer (8 bytes total) ─────────────────────────────────────

/// Size of the FIL trailer in bytes.
pub const SIZE_FIL_TRAILER: usize = 8;
// Trailer is at: page_size - SIZE_FIL_TRAILER
// old-style checksum: offset 0 within trailer (4 bytes)
// low 32 bits of LSN: offset 4 within trailer (4 bytes)

/// Start of page data (immediately after FIL header).
pub const FIL_PAGE_DATA: usize = 38;

// ── FSP Header (112 bytes, starts at FIL_PAGE_DATA on page 0) ──────

/// Size of the FSP header in bytes.
pub const FSP_HEADER_SIZE: usize = 112;
/// Offset of the space ID within the FSP header. 4 bytes.
pub const FSP_SPACE_ID: usize = 0;
/// Unused field in the FSP header. 4 bytes.
pub const FSP_NOT_USED: usize = 4;
/// Offset of the tablespace size (in pages) within the FSP header. 4 bytes.
pub const FSP_SIZE: usize = 8;
/// Offset of the minimum page not yet initialized. 4 bytes.
pub const FSP_FREE_LIMIT: usize = 12;
/// Offset of the FSP flags field. 4 bytes.
pub const FSP_SPACE_FLAGS: usize = 16;
/// Offset of the used-page count in the FSP_FREE_FRAG list. 4 bytes.
pub const FSP_FRAG_N_USED: usize = 20;

// ── FSP flags bit positions for page size detection ─────────────────

/// Bit position of the page size field within FSP flags.
pub const FSP_FLAGS_POS_PAGE_SSIZE: u32 = 6;
/// Bitmask for the 4-bit page size field within FSP flags.
pub const FSP_FLAGS_MASK_PAGE_SSIZE: u32 = 0xF << FSP_FLAGS_POS_PAGE_SSIZE;

// ── Page Header (INDEX page specific, starts at FIL_PAGE_DATA) ──────

/// Offset of the directory slot count. 2 bytes.
pub const PAGE_N_DIR_SLOTS: usize = 0;
/// Offset of the record heap top pointer. 2 bytes.
pub const PAGE_HEAP_TOP: usize = 2;
/// Offset of the heap record count (bit 15 = compact flag). 2 bytes.
pub const PAGE_N_HEAP: usize = 4;
/// Offset of the free record list pointer. 2 bytes.
pub const PAGE_FREE: usize = 6;
/// Offset of the deleted-record byte count (garbage). 2 bytes.
pub const PAGE_GARBAGE: usize = 8;
/// Offset of the last-inserted record pointer. 2 bytes.
pub const PAGE_LAST_INSERT: usize = 10;
/// Offset of the last insert direction. 2 bytes.
pub const PAGE_DIRECTION: usize = 12;
/// Offset of the consecutive same-direction insert count. 2 bytes.
pub const PAGE_N_DIRECTION: usize = 14;
/// Offset of the user record count. 2 bytes.
pub const PAGE_N_RECS: usize = 16;
/// Offset of the maximum transaction ID (secondary indexes only). 8 bytes.
pub const PAGE_MAX_TRX_ID: usize = 18;
/// Offset of the B+Tree level (0 = leaf). 2 bytes.
pub const PAGE_LEVEL: usize = 26;
/// Offset of the index ID. 8 bytes.
pub const PAGE_INDEX_ID: usize = 28;
/// Offset of the leaf segment FSEG header. 10 bytes.
pub const PAGE_BTR_SEG_LEAF: usize = 36;
/// Offset of the non-leaf segment FSEG header. 10 bytes.
pub const PAGE_BTR_SEG_TOP: usize = 46;
/// Total INDEX page header size (before FSEG headers).
pub const PAGE_HEADER_SIZE: usize = 56;

// ── FSEG Header ─────────────────────────────────────────────────────

/// Size of an FSEG (file segment) header in bytes.
pub const FSEG_HEADER_SIZE: usize = 10;

// ── Record extra bytes ──────────────────────────────────────────────

/// Extra bytes preceding each record in old-style (redundant) format.
pub const REC_N_OLD_EXTRA_BYTES: usize = 6;
/// Extra bytes preceding each record in new-style (compact) format.
pub const REC_N_NEW_EXTRA_BYTES: usize = 5;

// ── System record offsets (compact pages) ───────────────────────────

/// Computed data offset (FIL_PAGE_DATA + PAGE_HEADER + 2 * FSEG_HEADER).
pub const PAGE_DATA: usize = FIL_PAGE_DATA + PAGE_HEADER_SIZE + 2 * FSEG_HEADER_SIZE;
// Note: the MySQL source uses PAGE_DATA = 38 + 36 + 20 = 94
/// Actual system record data offset matching MySQL source.
pub const PAGE_DATA_OFFSET: usize = 94;

/// Offset of the infimum record (compact format).
pub const PAGE_NEW_INFIMUM: usize = PAGE_DATA_OFFSET + REC_N_NEW_EXTRA_BYTES; // 99
/// Offset of the supremum record (compact format).
pub const PAGE_NEW_SUPREMUM: usize = PAGE_DATA_OFFSET + 2 * REC_N_NEW_EXTRA_BYTES + 8; // 112
/// Offset of the infimum record (redundant format).
pub const PAGE_OLD_INFIMUM: usize = PAGE_DATA_OFFSET + 1 + REC_N_OLD_EXTRA_BYTES; // 101
/// Offset of the supremum record (redundant format).
pub const PAGE_OLD_SUPREMUM: usize = PAGE_DATA_OFFSET + 2 + 2 * REC_N_OLD_EXTRA_BYTES + 8; // 112

// ── Special values ──────────────────────────────────────────────────

/// Null page reference (0xFFFFFFFF / 4294967295).
pub const FIL_NULL: u32 = 0xFFFFFFFF;

// ── Checksum constants ──────────────────────────────────────────────

/// First random mask used by `ut_fold_ulint_pair` in legacy InnoDB checksums.
pub const UT_HASH_RANDOM_MASK: u32 = 1463735687;
/// Second random mask used by `ut_fold_ulint_pair` in legacy InnoDB checksums.
pub const UT_HASH_RANDOM_MASK2: u32 = 1653893711;

// ── Insert direction values ─────────────────────────────────────────

/// Insert direction: left.
pub const PAGE_LEFT: u16 = 1;
/// Insert direction: right.
pub const PAGE_RIGHT: u16 = 2;
/// Insert direction: same record position.
pub const PAGE_SAME_REC: u16 = 3;
/// Insert direction: same page.
pub const PAGE_SAME_PAGE: u16 = 4;
/// Insert direction: no direction.
pub const PAGE_NO_DIRECTION: u16 = 5;

// ── Encryption: page header fields ──────────────────────────────────

/// Offset where the pre-encryption page type is stashed (reuses the
/// flush-LSN field, which is only meaningful on page 0 of the system
/// tablespace). 2 bytes.
pub const FIL_PAGE_ORIGINAL_TYPE_V1: usize = FIL_PAGE_FILE_FLUSH_LSN;
/// Offset of the per-page key version stamp used in keyring mode. 4 bytes,
/// overlaps the low half of the flush-LSN field.
pub const FIL_PAGE_ENCRYPTION_KEY_VERSION: usize = FIL_PAGE_FILE_FLUSH_LSN + 4;
/// Minimum bytes a page's encrypted region must have for the two-pass
/// tail trick to apply (two AES blocks plus the header).
pub const AES_BLOCK_SIZE: usize = 16;
/// Minimum length of the data actually passed to the cryptor.
pub const MIN_ENCRYPTION_LEN: usize = 2 * AES_BLOCK_SIZE + FIL_PAGE_DATA;
/// Trailing bytes reserved in plaintext for keyring-mode non-zip pages
/// (mirrors the low 4 bytes of the LSN so torn-page detection still works).
/// Written by [`crate::innodb::cryptor::encrypt_page`] /
/// [`crate::innodb::cryptor::decrypt_page`] into the last bytes of the page.
pub const FIL_PAGE_ENCRYPT_LSN_MIRROR_LEN: usize = 4;
/// Offset, within the data region, of the stored compressed-payload size
/// for `FIL_PAGE_COMPRESSED`/`FIL_PAGE_COMPRESSED_AND_ENCRYPTED` pages (2
/// bytes, big-endian), immediately followed by a 1-byte compression method.
/// Always left in plaintext, even when the rest of the page is encrypted,
/// so a reader can size the encrypted region before decrypting it.
pub const FIL_PAGE_COMPRESSED_SIZE_OFFSET: usize = 0;
/// Size of the compressed-page sub-header (stored length + compression
/// method) that precedes the compressed payload.
pub const FIL_PAGE_COMPRESSION_HEADER_SIZE: usize = 3;
/// Bytes reserved immediately after the compression sub-header for
/// `key_version` (4B) and a post-encryption checksum (4B) on a
/// keyring-mode compressed page, left in plaintext like the rest of the
/// compression sub-header.
pub const FIL_PAGE_COMPRESSED_ENCRYPTION_HEADER_SIZE: usize = 8;

// ── Encryption info blob (page 0) ────────────────────────────────────

/// Size of the magic marker prefix on an encryption info blob.
pub const ENCRYPTION_MAGIC_SIZE: usize = 3;
/// Magic for encryption info v1 (`lCA`, pre-8.0.5, no server uuid).
pub const ENCRYPTION_MAGIC_V1: &[u8] = b"lCA";
/// Magic for encryption info v2 (`lCB`, adds server uuid).
pub const ENCRYPTION_MAGIC_V2: &[u8] = b"lCB";
/// Magic for encryption info v3 (`lCC`, MySQL 8.0.5+, the emit format).
pub const ENCRYPTION_MAGIC_V3: &[u8] = b"lCC";
/// Magic for the redo log keyring encryption info variant.
pub const ENCRYPTION_MAGIC_RK_V2: &[u8] = b"lRK";
/// Length of the server UUID field (36 ASCII bytes, standard UUID string).
pub const ENCRYPTION_SERVER_UUID_LEN: usize = 36;
/// Length of the wrapped `key || iv` region (32 + 32 bytes), AES-256-ECB.
pub const ENCRYPTION_KEY_IV_LEN: usize = 64;
/// Full size of a v2/v3 encryption info blob: magic + id + uuid + wrapped + crc.
pub const ENCRYPTION_INFO_SIZE: usize = ENCRYPTION_MAGIC_SIZE
    + 4
    + ENCRYPTION_SERVER_UUID_LEN
    + ENCRYPTION_KEY_IV_LEN
    + 4;
/// Size of a v1 blob using the short (non-legacy-padded) master key id form.
pub const ENCRYPTION_INFO_SIZE_V1: usize =
    ENCRYPTION_MAGIC_SIZE + 4 + ENCRYPTION_KEY_IV_LEN + 4;
/// Size of a v1 blob using the legacy 8-byte master key id representation.
pub const ENCRYPTION_INFO_SIZE_V1_LEGACY: usize =
    ENCRYPTION_MAGIC_SIZE + 8 + ENCRYPTION_KEY_IV_LEN + 4;
/// Sentinel master key id meaning "no rotation has ever happened".
pub const DEFAULT_MASTER_KEY_ID: u32 = 0;
/// Hard-coded bootstrap master key used while `DEFAULT_MASTER_KEY_ID` is active.
pub const DEFAULT_MASTER_KEY: [u8; 32] = [0x36; 32];

// ── Redo log block (512 bytes) ───────────────────────────────────────

/// Size of a redo log block.
pub const LOG_BLOCK_SIZE: usize = 512;
/// Size of the log block header (8.0.30+ layout).
pub const LOG_BLOCK_HDR_SIZE: usize = 12;
/// Size of the log block trailer (checksum).
pub const LOG_BLOCK_TRL_SIZE: usize = 4;
/// Byte offset of the checksum within a log block.
pub const LOG_BLOCK_CHECKSUM_OFFSET: usize = LOG_BLOCK_SIZE - LOG_BLOCK_TRL_SIZE;
/// Bit within the first header word marking the block as containing data
/// flushed to disk (reused here as the "this block is encrypted" bit,
/// mirroring how MySQL overlays flags into the same header word).
pub const LOG_BLOCK_ENCRYPT_BIT_MASK: u32 = 0x8000_0000;
/// Offset of the header word carrying the encrypted-bit flag.
pub const LOG_BLOCK_HDR_NO: usize = 0;

// ── XDES (extent descriptor) entries on page 0 ───────────────────────

/// Size of a single XDES entry.
pub const XDES_SIZE: usize = 40;

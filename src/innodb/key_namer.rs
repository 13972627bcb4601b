//! Canonical keyring name construction for master keys and system keys.
//!
//! Pure, stateless functions. The three naming schemes below are the only
//! identity keys have outside the keyring; changing their shape breaks
//! on-disk compatibility with every tablespace that was encrypted under
//! the old names.

/// Maximum length of a name handed to the keyring, matching the limit
/// MySQL enforces on `Encryption::MASTER_KEY_NAME_MAX_LEN`.
pub const MASTER_KEY_NAME_MAX_LEN: usize = 100;

/// Default keyring name prefix for InnoDB master keys.
pub const INNODB_KEY_PREFIX: &str = "INNODBKey";

/// Build a master key name: `<prefix>-<server_uuid>-<master_key_id>`.
///
/// `server_uuid` must be non-empty; callers that would otherwise build a
/// keyring-bound name with an empty uuid have a programming error.
///
/// # Examples
///
/// ```
/// use idb::innodb::key_namer::master_key_name;
///
/// let name = master_key_name("INNODBKey", "12345678-1234-1234-1234-123456789abc", 1);
/// assert_eq!(name, "INNODBKey-12345678-1234-1234-1234-123456789abc-1");
/// ```
pub fn master_key_name(prefix: &str, server_uuid: &str, master_key_id: u32) -> String {
    debug_assert!(!server_uuid.is_empty(), "server_uuid must be non-empty");
    let name = format!("{}-{}-{}", prefix, server_uuid, master_key_id);
    debug_assert!(name.len() <= MASTER_KEY_NAME_MAX_LEN);
    name
}

/// Build a legacy (pre-5.7.11 uuid support) master key name:
/// `<prefix>-<server_id>-<master_key_id>`.
///
/// Used only as a compatibility fallback when the uuid-based name is not
/// found in the keyring.
pub fn master_key_name_legacy(prefix: &str, server_id: &str, master_key_id: u32) -> String {
    debug_assert!(!server_id.is_empty(), "server_id must be non-empty");
    format!("{}-{}-{}", prefix, server_id, master_key_id)
}

/// Build a Percona system key name: `<psprefix>-<key_id>-<uuid>`.
///
/// # Examples
///
/// ```
/// use idb::innodb::key_namer::percona_system_key_name;
///
/// let name = percona_system_key_name("percona_innodb", 3, "uuid-1234");
/// assert_eq!(name, "percona_innodb-3-uuid-1234");
/// ```
pub fn percona_system_key_name(ps_prefix: &str, key_id: u32, uuid: &str) -> String {
    debug_assert!(!uuid.is_empty(), "uuid must be non-empty");
    format!("{}-{}-{}", ps_prefix, key_id, uuid)
}

/// Build a versioned Percona system key name:
/// `<psprefix>-<key_id>-<uuid>:<version>`.
///
/// This is the name under which a keyring-mode tablespace key is stored;
/// each rotation of that tablespace's key bumps `version` and stores a new
/// entry rather than overwriting the old one.
///
/// # Examples
///
/// ```
/// use idb::innodb::key_namer::versioned_system_key_name;
///
/// let name = versioned_system_key_name("percona_innodb", 3, "uuid-1234", 2);
/// assert_eq!(name, "percona_innodb-3-uuid-1234:2");
/// ```
pub fn versioned_system_key_name(ps_prefix: &str, key_id: u32, uuid: &str, version: u32) -> String {
    debug_assert!(!uuid.is_empty(), "uuid must be non-empty");
    format!("{}-{}-{}:{}", ps_prefix, key_id, uuid, version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_key_name() {
        let n = master_key_name("INNODBKey", "uuid-a", 1);
        assert_eq!(n, "INNODBKey-uuid-a-1");
    }

    #[test]
    fn test_master_key_name_legacy() {
        let n = master_key_name_legacy("INNODBKey", "7", 3);
        assert_eq!(n, "INNODBKey-7-3");
    }

    #[test]
    fn test_percona_system_key_name() {
        let n = percona_system_key_name("percona_innodb", 5, "uuid-b");
        assert_eq!(n, "percona_innodb-5-uuid-b");
    }

    #[test]
    fn test_versioned_system_key_name() {
        let n = versioned_system_key_name("percona_innodb", 5, "uuid-b", 7);
        assert_eq!(n, "percona_innodb-5-uuid-b:7");
    }

    #[test]
    fn test_name_stays_within_bound() {
        let n = master_key_name("INNODBKey", "12345678-1234-1234-1234-123456789abc", 4_000_000_000);
        assert!(n.len() <= MASTER_KEY_NAME_MAX_LEN);
    }
}

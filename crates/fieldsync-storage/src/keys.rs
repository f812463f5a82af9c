use fieldsync_types::ConfigKey;

/// `config` keyspace: `value/` ++ key_name_utf8 → bincode(ConfigValue)
pub const VALUE_PREFIX: &[u8] = b"value/";

/// `config` keyspace: last successfully applied patch → bincode(u64)
pub const LAST_APPLIED_KEY: &[u8] = b"meta/last_applied_patch_id";

pub fn value_key(key: ConfigKey) -> Vec<u8> {
    let name = key.as_str().as_bytes();
    let mut buf = Vec::with_capacity(VALUE_PREFIX.len() + name.len());
    buf.extend_from_slice(VALUE_PREFIX);
    buf.extend_from_slice(name);
    buf
}

/// Key name stored under a `value/` entry, if `raw` is one.
pub fn parse_value_key(raw: &[u8]) -> Option<&str> {
    raw.strip_prefix(VALUE_PREFIX).and_then(|name| std::str::from_utf8(name).ok())
}

/// `audit` keyspace: `seq(8)` big-endian → lexicographic order = append order.
pub fn audit_key(seq: u64) -> [u8; 8] {
    seq.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_keys_round_trip() {
        for key in ConfigKey::ALL {
            let raw = value_key(*key);
            assert!(raw.starts_with(VALUE_PREFIX));
            assert_eq!(parse_value_key(&raw), Some(key.as_str()));
        }
    }

    #[test]
    fn meta_key_is_not_a_value_key() {
        assert_eq!(parse_value_key(LAST_APPLIED_KEY), None);
    }

    #[test]
    fn audit_keys_sort_by_sequence() {
        assert!(audit_key(1) < audit_key(2));
        assert!(audit_key(255) < audit_key(256));
        assert!(audit_key(u64::MAX - 1) < audit_key(u64::MAX));
    }
}

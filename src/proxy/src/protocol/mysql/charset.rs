//! Minimal slice of the MySQL charset/collation ID table needed for the
//! handshake greeting and column-definition packets. See
//! <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_character_set.html>.

use std::collections::HashMap;
use std::sync::OnceLock;

/// `utf8mb4_general_ci`, the collation this proxy advertises in its
/// initial handshake and in every column definition it emits.
pub const UTF8_MB4_GENERAL_CI: u8 = 45;

/// Collation ID used when none is negotiated explicitly.
pub const DEFAULT_COLLATION_ID: u8 = UTF8_MB4_GENERAL_CI;

const COLLATIONS: &[(&str, u8)] = &[
    ("latin1_swedish_ci", 8),
    ("utf8_general_ci", 33),
    ("utf8mb4_general_ci", 45),
    ("utf8mb4_bin", 46),
    ("binary", 63),
    ("utf8mb4_unicode_ci", 224),
    ("utf8mb4_0900_ai_ci", 255),
];

/// Name → collation ID, for code that negotiates by name.
pub fn collation_names() -> &'static HashMap<&'static str, u8> {
    static NAMES: OnceLock<HashMap<&'static str, u8>> = OnceLock::new();
    NAMES.get_or_init(|| COLLATIONS.iter().copied().collect())
}

/// Best-effort ID → name lookup; unrecognized IDs fall back to
/// `utf8mb4_general_ci`.
pub fn collation_name(id: u8) -> &'static str {
    COLLATIONS
        .iter()
        .find(|(_, cid)| *cid == id)
        .map(|(name, _)| *name)
        .unwrap_or("utf8mb4_general_ci")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_collation_is_utf8mb4_general_ci() {
        assert_eq!(DEFAULT_COLLATION_ID, 45);
        assert_eq!(collation_name(DEFAULT_COLLATION_ID), "utf8mb4_general_ci");
    }

    #[test]
    fn unknown_collation_falls_back() {
        assert_eq!(collation_name(200), "utf8mb4_general_ci");
    }

    #[test]
    fn name_lookup_round_trips() {
        assert_eq!(*collation_names().get("utf8_general_ci").unwrap(), 33u8);
    }
}

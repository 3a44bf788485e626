//! Deterministic physical table and index names.

use crate::error::{StorageError, StorageResult};
use regex_lite::Regex;

const NAME_PART_MAX_LENGTH: usize = 40;
const INDEX_NAME_MAX_LENGTH: usize = 120;

/// Reduce `value` to a lowercase `[a-z0-9_]` identifier of at most `max_length` bytes.
///
/// `-` and `.` become `_`, other disallowed runs collapse to a single `_`,
/// and a leading digit gets a `p_` prefix.
pub fn sanitize_identifier(value: &str, max_length: usize) -> StorageResult<String> {
    let disallowed = Regex::new(r"[^a-z0-9_]+")
        .map_err(|e| StorageError::Internal(format!("Regex error: {e}")))?;
    let underscores =
        Regex::new(r"_+").map_err(|e| StorageError::Internal(format!("Regex error: {e}")))?;

    let lowered = value.trim().to_lowercase().replace(['-', '.'], "_");
    let replaced = disallowed.replace_all(&lowered, "_");
    let collapsed = underscores.replace_all(&replaced, "_");
    let trimmed = collapsed.trim_matches('_');
    if trimmed.is_empty() {
        return Err(StorageError::ddl(format!(
            "Identifier '{value}' cannot be empty after sanitization"
        )));
    }

    let mut normalized = if trimmed.starts_with(|c: char| c.is_ascii_digit()) {
        format!("p_{trimmed}")
    } else {
        trimmed.to_string()
    };
    // Only ASCII remains, so byte truncation is safe.
    normalized.truncate(max_length);
    Ok(normalized)
}

/// `plg__<plugin>__<table>`.
pub fn physical_table_name(plugin_id: &str, logical_table: &str) -> StorageResult<String> {
    Ok(format!(
        "plg__{}__{}",
        sanitize_identifier(plugin_id, NAME_PART_MAX_LENGTH)?,
        sanitize_identifier(logical_table, NAME_PART_MAX_LENGTH)?
    ))
}

/// `ix__<physical table>__<index>`, sanitized as a whole (so underscore runs
/// collapse to one).
pub fn physical_index_name(physical_table: &str, logical_index: &str) -> StorageResult<String> {
    sanitize_identifier(
        &format!("ix__{physical_table}__{logical_index}"),
        INDEX_NAME_MAX_LENGTH,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sanitize_default(value: &str) -> StorageResult<String> {
        sanitize_identifier(value, 48)
    }

    #[test]
    fn sanitizes_common_shapes() {
        assert_eq!(sanitize_default("Net-Scanner.v2").unwrap(), "net_scanner_v2");
        assert_eq!(sanitize_default("  héllo   wörld ").unwrap(), "h_llo_w_rld");
        assert_eq!(sanitize_default("9lives").unwrap(), "p_9lives");
        assert_eq!(sanitize_default("__a__b__").unwrap(), "a_b");
    }

    #[test]
    fn empty_after_sanitization_is_ddl_error() {
        let err = sanitize_default("!!!").unwrap_err();
        assert_eq!(err.code(), "storage_ddl_not_allowed");
    }

    #[test]
    fn table_and_index_names() {
        let table = physical_table_name("net-scanner", "Hosts").unwrap();
        assert_eq!(table, "plg__net_scanner__hosts");
        assert_eq!(
            physical_index_name(&table, "by-status").unwrap(),
            "ix_plg_net_scanner_hosts_by_status"
        );
    }

    #[test]
    fn distinct_plugins_never_share_a_table() {
        let a = physical_table_name("alpha", "items").unwrap();
        let b = physical_table_name("beta", "items").unwrap();
        assert_ne!(a, b);
    }

    proptest! {
        #[test]
        fn sanitized_identifiers_are_well_formed(input in "\\PC{0,80}", max in 1usize..64) {
            if let Ok(name) = sanitize_identifier(&input, max) {
                prop_assert!(!name.is_empty());
                prop_assert!(name.len() <= max);
                prop_assert!(name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
                prop_assert!(!name.starts_with(|c: char| c.is_ascii_digit()));
                prop_assert!(!name.contains("__"));
            }
        }

        #[test]
        fn sanitize_is_idempotent(input in "[a-zA-Z0-9 ._-]{1,40}") {
            if let Ok(once) = sanitize_identifier(&input, 48) {
                prop_assert_eq!(sanitize_identifier(&once, 48).unwrap(), once);
            }
        }
    }
}

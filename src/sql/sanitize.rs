//! SQL Identifier and Literal Escaping
//!
//! Every table name, column name and string constant that ends up inside a
//! generated statement goes through [`identifier`] or [`literal_string`].

/// PostgreSQL truncates identifiers beyond this many bytes
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Quote a PostgreSQL identifier.
///
/// Embedded double quotes are doubled and NUL bytes are dropped.
///
/// # Example
/// ```
/// use runtara_datastore::sql::sanitize::identifier;
/// assert_eq!(identifier("users"), "\"users\"");
/// assert_eq!(identifier("my\"table"), "\"my\"\"table\"");
/// ```
pub fn identifier(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\"").replace('\0', ""))
}

/// Quote a PostgreSQL string literal.
///
/// Embedded single quotes are doubled and NUL bytes are dropped.
///
/// # Example
/// ```
/// use runtara_datastore::sql::sanitize::literal_string;
/// assert_eq!(literal_string("it's"), "'it''s'");
/// ```
pub fn literal_string(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''").replace('\0', ""))
}

/// Default field-name rule: non-empty, no surrounding whitespace, no leading
/// underscore and no double quote.
pub fn is_valid_field_name(name: &str) -> bool {
    !name.is_empty() && name == name.trim() && !name.starts_with('_') && !name.contains('"')
}

/// Default table/alias-name rule: a valid field name without `%`.
pub fn is_valid_table_name(name: &str) -> bool {
    !name.contains('%') && is_valid_field_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRICKY: &[&str] = &[
        "",
        "plain",
        "with space",
        "a\"b",
        "\"\"",
        "a'b",
        "''",
        "nul\0byte",
        "\0",
        "mixed\"'\0;--",
        "Robert'); DROP TABLE students;--",
        "ünïcödé \"名前\"",
    ];

    /// Undo identifier quoting the way the server parses it
    fn parse_identifier(quoted: &str) -> String {
        let inner = &quoted[1..quoted.len() - 1];
        inner.replace("\"\"", "\"")
    }

    fn parse_literal(quoted: &str) -> String {
        let inner = &quoted[1..quoted.len() - 1];
        inner.replace("''", "'")
    }

    /// True when every quote char inside the delimiters is part of a doubled pair
    fn quotes_balanced(inner: &str, quote: char) -> bool {
        let mut chars = inner.chars().peekable();
        while let Some(c) = chars.next() {
            if c == quote && chars.next() != Some(quote) {
                return false;
            }
        }
        true
    }

    // =========================================================================
    // identifier Tests
    // =========================================================================

    #[test]
    fn test_identifier_simple() {
        assert_eq!(identifier("users"), "\"users\"");
        assert_eq!(identifier("User Name"), "\"User Name\"");
    }

    #[test]
    fn test_identifier_doubles_quotes() {
        assert_eq!(identifier("my\"table"), "\"my\"\"table\"");
        assert_eq!(identifier("\"already\""), "\"\"\"already\"\"\"");
    }

    #[test]
    fn test_identifier_strips_nul() {
        assert_eq!(identifier("a\0b"), "\"ab\"");
    }

    #[test]
    fn test_identifier_round_trip() {
        for s in TRICKY {
            let quoted = identifier(s);
            assert!(quoted.starts_with('"') && quoted.ends_with('"'));
            assert!(!quoted.contains('\0'));
            assert!(quotes_balanced(&quoted[1..quoted.len() - 1], '"'), "{quoted}");
            assert_eq!(parse_identifier(&quoted), s.replace('\0', ""));
        }
    }

    // =========================================================================
    // literal_string Tests
    // =========================================================================

    #[test]
    fn test_literal_simple() {
        assert_eq!(literal_string("english"), "'english'");
    }

    #[test]
    fn test_literal_doubles_quotes() {
        assert_eq!(literal_string("it's"), "'it''s'");
        assert_eq!(literal_string("'; DROP TABLE x; --"), "'''; DROP TABLE x; --'");
    }

    #[test]
    fn test_literal_round_trip() {
        for s in TRICKY {
            let quoted = literal_string(s);
            assert!(!quoted.contains('\0'));
            assert!(quotes_balanced(&quoted[1..quoted.len() - 1], '\''), "{quoted}");
            assert_eq!(parse_literal(&quoted), s.replace('\0', ""));
        }
    }

    // =========================================================================
    // Name Validity Tests
    // =========================================================================

    #[test]
    fn test_valid_field_names() {
        assert!(is_valid_field_name("name"));
        assert!(is_valid_field_name("Name With Spaces"));
        assert!(is_valid_field_name("naïve"));
    }

    #[test]
    fn test_invalid_field_names() {
        assert!(!is_valid_field_name(""));
        assert!(!is_valid_field_name("_id"));
        assert!(!is_valid_field_name(" padded"));
        assert!(!is_valid_field_name("trailing "));
        assert!(!is_valid_field_name("has\"quote"));
    }

    #[test]
    fn test_table_names() {
        assert!(is_valid_table_name("my-alias"));
        assert!(!is_valid_table_name("100%"));
        assert!(!is_valid_table_name("_private"));
    }
}

//! Content digests and the whitespace-stable code key used by the cache
//! and the incremental compiler.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of arbitrary content.
#[must_use]
pub fn hash_content(content: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_ref());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Canonical form of a code snippet: trailing whitespace stripped per line,
/// blank lines dropped, `\n` terminators. Comments and semantics are left
/// untouched; only layout noise is removed.
#[must_use]
pub fn normalize_code(code: &str) -> String {
    code.lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Cache key for a snippet: SHA-256 over the normalized form, so whitespace
/// and blank-line variants share an id.
#[must_use]
pub fn hash_code(code: &str) -> String {
    hash_content(normalize_code(code))
}

/// Order-insensitive combination of several digests into one.
#[must_use]
pub fn combine_hashes(hashes: &[String]) -> String {
    let mut sorted: Vec<&str> = hashes.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    hash_content(sorted.join("|"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_content_is_hex_sha256() {
        let hash = hash_content("hello");
        assert_eq!(hash.len(), 64);
        assert_eq!(
            hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_normalize_strips_trailing_whitespace_and_blanks() {
        let code = "result = 1   \n\n\n  x = 2\t\n";
        assert_eq!(normalize_code(code), "result = 1\n  x = 2");
    }

    #[test]
    fn test_normalize_handles_crlf() {
        assert_eq!(normalize_code("a = 1\r\nb = 2\r\n"), "a = 1\nb = 2");
    }

    #[test]
    fn test_hash_code_stable_under_whitespace_variants() {
        let a = "result = compute(1, 2)\nprint_result(result)";
        let b = "result = compute(1, 2)   \n\n\nprint_result(result)\n\n";
        let c = "result = compute(1, 2)\r\nprint_result(result)\r\n";
        assert_eq!(hash_code(a), hash_code(b));
        assert_eq!(hash_code(a), hash_code(c));
    }

    #[test]
    fn test_hash_code_distinguishes_semantic_changes() {
        assert_ne!(hash_code("result = 1"), hash_code("result = 2"));
        // Leading indentation is semantic in Python and must not collapse.
        assert_ne!(hash_code("  result = 1"), hash_code("result = 1"));
    }

    #[test]
    fn test_combine_hashes_is_order_insensitive() {
        let a = hash_content("one");
        let b = hash_content("two");
        assert_eq!(
            combine_hashes(&[a.clone(), b.clone()]),
            combine_hashes(&[b, a])
        );
    }

    #[test]
    fn test_combine_hashes_empty_is_stable() {
        assert_eq!(combine_hashes(&[]), combine_hashes(&[]));
    }
}

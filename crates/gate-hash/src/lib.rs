// SPDX-License-Identifier: MIT OR Apache-2.0
//! gate-hash
#![deny(unsafe_code)]
//!
//! Canonical JSON serialization and the content-hashing rules that make a
//! recorded bundle bit-reproducible: file hashing, directory hashing, and
//! whole-bundle hashing. These rules are exact by specification — they
//! define cross-implementation equivalence, not just an implementation
//! detail of this crate.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};

/// The fixed component order used when hashing a whole bundle.
pub const COMPONENT_ORDER: &[&str] =
    &["env", "clock", "network", "fsDiff", "logs", "prompts", "intents"];

/// Canonicalize `value` to a JSON string with object keys sorted
/// lexicographically at every depth. Goes through [`serde_json::Value`],
/// whose `Map` is `BTreeMap`-backed, so no separate JCS crate is needed.
pub fn canonical_json<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let v = serde_json::to_value(value)?;
    serde_json::to_string(&v)
}

/// Canonicalize `value` to the same bytes [`canonical_json`] would produce.
pub fn canonical_bytes<T: Serialize>(value: &T) -> serde_json::Result<Vec<u8>> {
    canonical_json(value).map(String::into_bytes)
}

/// Hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Hash of a regular file: SHA-256 of its raw byte content.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let bytes = fs::read(path)?;
    Ok(sha256_hex(&bytes))
}

/// Hash of a directory tree: SHA-256 over the literal prefix `"dir\n"`
/// followed by, for each regular file under `dir` in lexicographic relative
/// path order, the line `"<relpath>\n<hex-file-hash>\n"`.
///
/// Relative paths use `/` as the separator regardless of platform.
pub fn hash_dir(dir: &Path) -> std::io::Result<String> {
    let mut entries: Vec<(String, Vec<u8>)> = Vec::new();
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .expect("walkdir entries are under dir")
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let bytes = fs::read(entry.path())?;
        entries.push((rel, bytes));
    }
    Ok(hash_dir_entries(&entries))
}

/// Same rule as [`hash_dir`], but over an already in-memory set of
/// `(relpath, bytes)` pairs instead of a real directory. Used to validate a
/// bundle that has been loaded into memory without re-extracting to disk.
#[must_use]
pub fn hash_dir_entries(entries: &[(String, Vec<u8>)]) -> String {
    let mut sorted: Vec<(&str, String)> = entries
        .iter()
        .map(|(rel, bytes)| (rel.as_str(), sha256_hex(bytes)))
        .collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = Sha256::new();
    hasher.update(b"dir\n");
    for (rel, hash) in &sorted {
        hasher.update(rel.as_bytes());
        hasher.update(b"\n");
        hasher.update(hash.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Whole-bundle hash: SHA-256 over the canonical manifest bytes followed by,
/// for each component in [`COMPONENT_ORDER`], the line
/// `"<component>:<hex-hash>\n"`. Every component in [`COMPONENT_ORDER`] must
/// be present in `component_hashes`, or this returns `None`.
#[must_use]
pub fn bundle_hash(
    canonical_manifest: &[u8],
    component_hashes: &BTreeMap<String, String>,
) -> Option<String> {
    let mut hasher = Sha256::new();
    hasher.update(canonical_manifest);
    for component in COMPONENT_ORDER {
        let hash = component_hashes.get(*component)?;
        hasher.update(component.as_bytes());
        hasher.update(b":");
        hasher.update(hash.as_bytes());
        hasher.update(b"\n");
    }
    Some(format!("{:x}", hasher.finalize()))
}

/// The "first 1000 bytes contain a NUL byte ⇒ binary" heuristic, preserved
/// verbatim from the source this format is modeled on.
#[must_use]
pub fn looks_binary(bytes: &[u8]) -> bool {
    let probe = &bytes[..bytes.len().min(1000)];
    probe.contains(&0u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;

    #[test]
    fn canonical_json_sorts_keys() {
        let value = serde_json::json!({"b": 1, "a": 2, "c": {"z": 1, "y": 2}});
        let s = canonical_json(&value).unwrap();
        assert_eq!(s, r#"{"a":2,"b":1,"c":{"y":2,"z":1}}"#);
    }

    #[test]
    fn sha256_hex_is_stable() {
        let h1 = sha256_hex(b"hello");
        let h2 = sha256_hex(b"hello");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn sha256_hex_known_vector() {
        // SHA-256("") = e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn hash_file_matches_manual_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.txt");
        fs::write(&path, b"payload").unwrap();
        assert_eq!(hash_file(&path).unwrap(), sha256_hex(b"payload"));
    }

    #[test]
    fn hash_dir_depends_on_relative_path_and_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a.txt"), b"aaa").unwrap();
        fs::write(dir.path().join("sub/b.txt"), b"bbb").unwrap();

        let h1 = hash_dir(dir.path()).unwrap();

        let dir2 = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir2.path().join("sub")).unwrap();
        fs::write(dir2.path().join("a.txt"), b"aaa").unwrap();
        fs::write(dir2.path().join("sub/b.txt"), b"bbb").unwrap();
        let h2 = hash_dir(dir2.path()).unwrap();

        assert_eq!(h1, h2);
    }

    #[test]
    fn hash_dir_changes_when_a_byte_changes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"aaa").unwrap();
        let h1 = hash_dir(dir.path()).unwrap();
        fs::write(dir.path().join("a.txt"), b"aab").unwrap();
        let h2 = hash_dir(dir.path()).unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn hash_dir_entries_matches_hash_dir_for_same_content() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a.txt"), b"aaa").unwrap();
        fs::write(dir.path().join("sub/b.txt"), b"bbb").unwrap();
        let from_disk = hash_dir(dir.path()).unwrap();

        let entries = vec![
            ("a.txt".to_string(), b"aaa".to_vec()),
            ("sub/b.txt".to_string(), b"bbb".to_vec()),
        ];
        let from_memory = hash_dir_entries(&entries);
        assert_eq!(from_disk, from_memory);
    }

    #[test]
    fn bundle_hash_requires_all_components() {
        let mut map = Map::new();
        map.insert("env".to_string(), "h".to_string());
        assert!(bundle_hash(b"{}", &map).is_none());
    }

    #[test]
    fn bundle_hash_is_order_sensitive_internally_but_stable_for_same_input() {
        let mut map = Map::new();
        for c in COMPONENT_ORDER {
            map.insert((*c).to_string(), sha256_hex(c.as_bytes()));
        }
        let h1 = bundle_hash(b"{}", &map).unwrap();
        let h2 = bundle_hash(b"{}", &map).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn bundle_hash_changes_if_any_component_hash_changes() {
        let mut map = Map::new();
        for c in COMPONENT_ORDER {
            map.insert((*c).to_string(), sha256_hex(c.as_bytes()));
        }
        let h1 = bundle_hash(b"{}", &map).unwrap();
        map.insert("logs".to_string(), sha256_hex(b"tampered"));
        let h2 = bundle_hash(b"{}", &map).unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn looks_binary_detects_embedded_nul() {
        assert!(looks_binary(b"abc\0def"));
        assert!(!looks_binary(b"abcdef"));
    }

    #[test]
    fn looks_binary_only_scans_first_1000_bytes() {
        let mut bytes = vec![b'a'; 1000];
        bytes.push(0u8);
        assert!(!looks_binary(&bytes));
        bytes[999] = 0u8;
        assert!(looks_binary(&bytes));
    }

    proptest::proptest! {
        #[test]
        fn canonical_json_is_deterministic(n in 0i64..1000, s in ".*") {
            let value = serde_json::json!({"n": n, "s": s});
            let a = canonical_json(&value).unwrap();
            let b = canonical_json(&value).unwrap();
            proptest::prop_assert_eq!(a, b);
        }
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0
//! gate-bundle
#![deny(unsafe_code)]
//!
//! The Trace Bundle Engine: `create`, `open`, `validate`, and `hash` over the
//! gzip-compressed tar container described in the bundle file layout. Every
//! byte-level rule here (component paths, tar header fields, hash formula)
//! is load-bearing: two implementations that disagree on any of them
//! disagree on what a bundle *is*.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;

use chrono::Utc;
use gate_core::{IntentRecord, Manifest, ManifestFiles, MANIFEST_VERSION};
use gate_error::{ErrorCode, GateError};
use serde_json::Value;

/// The relative path of each single-file component.
mod component_path {
    pub const ENV: &str = "env.json";
    pub const CLOCK: &str = "clock.json";
    pub const NETWORK: &str = "network.har";
    pub const INTENTS: &str = "intents.jsonl";
    pub const FS_DIFF: &str = "fs-diff";
    pub const LOGS: &str = "logs";
    pub const PROMPTS: &str = "prompts";
}

/// Which components are single files vs. multi-file directory prefixes.
const DIR_COMPONENTS: &[&str] = &["fsDiff", "logs", "prompts"];

fn manifest_path_for(component: &str) -> &'static str {
    match component {
        "env" => component_path::ENV,
        "clock" => component_path::CLOCK,
        "network" => component_path::NETWORK,
        "intents" => component_path::INTENTS,
        "fsDiff" => component_path::FS_DIFF,
        "logs" => component_path::LOGS,
        "prompts" => component_path::PROMPTS,
        _ => unreachable!("component names are fixed by gate_hash::COMPONENT_ORDER"),
    }
}

/// Caller-supplied inputs to [`create`], before paths/hashes are assigned.
#[derive(Debug, Clone, Default)]
pub struct BundleInput {
    pub env: Value,
    pub clock: Value,
    pub network: Value,
    pub fs_diff: FsDiffInput,
    /// Filenames to bytes, e.g. `stdout.log`, `stderr.log`, `policy.yaml`.
    pub logs: BTreeMap<String, Vec<u8>>,
    /// Ordered prompt/response recordings, written as `prompts/NNNN.json`.
    pub prompts: Vec<Vec<u8>>,
    pub intents: Vec<IntentRecord>,
    pub description: Option<String>,
    pub metadata: Option<Value>,
}

/// The filesystem diff: a base snapshot, the post-change files, and the
/// list of paths the run deleted.
#[derive(Debug, Clone, Default)]
pub struct FsDiffInput {
    /// Relative path to bytes, archived verbatim into `fs-diff/base.tar`.
    pub base: BTreeMap<String, Vec<u8>>,
    /// Relative path to bytes, written under `fs-diff/diff/files/`.
    pub files: BTreeMap<String, Vec<u8>>,
    /// Relative paths the run deleted, written to `fs-diff/diff/deleted.json`.
    pub deleted: Vec<String>,
}

/// Classify each changed file as binary or text using the "first 1000
/// bytes contain a NUL byte" heuristic, preserved verbatim per the open
/// question this format resolves. Exposed for callers (e.g. the replay
/// verifier) that need to decide how to present a diff.
#[must_use]
pub fn classify_fs_diff_files(files: &BTreeMap<String, Vec<u8>>) -> BTreeMap<String, bool> {
    files
        .iter()
        .map(|(path, bytes)| (path.clone(), gate_hash::looks_binary(bytes)))
        .collect()
}

/// An opened or freshly created bundle: its manifest plus every component
/// byte held in memory, keyed by tar-relative path.
#[derive(Debug, Clone)]
pub struct Bundle {
    pub manifest: Manifest,
    entries: BTreeMap<String, Vec<u8>>,
}

impl Bundle {
    /// Raw bytes for a tar-relative path, if present.
    #[must_use]
    pub fn entry(&self, path: &str) -> Option<&[u8]> {
        self.entries.get(path).map(Vec::as_slice)
    }

    /// All entries whose path starts with `"<prefix>/"`, relative path
    /// stripped of that prefix.
    #[must_use]
    pub fn entries_under(&self, prefix: &str) -> Vec<(String, &[u8])> {
        let needle = format!("{prefix}/");
        self.entries
            .iter()
            .filter_map(|(path, bytes)| {
                path.strip_prefix(&needle)
                    .map(|rel| (rel.to_string(), bytes.as_slice()))
            })
            .collect()
    }

    /// Replace or insert a raw entry. Test/tamper tooling only — bundles are
    /// otherwise immutable once created.
    pub fn set_entry(&mut self, path: impl Into<String>, bytes: Vec<u8>) {
        self.entries.insert(path.into(), bytes);
    }

    /// Serialize this bundle back out to a gzip-compressed tar at `path`.
    pub fn write_to(&self, path: &Path) -> Result<(), GateError> {
        let file = std::fs::File::create(path).map_err(io_error)?;
        write_tar_gz(file, &self.entries)
    }

    /// Parse `intents.jsonl` into its ordered intent records.
    pub fn intents(&self) -> Result<Vec<IntentRecord>, GateError> {
        let bytes = self
            .entry(component_path::INTENTS)
            .ok_or_else(|| GateError::new(ErrorCode::BundleInvalid, "intents component missing"))?;
        std::str::from_utf8(bytes)
            .map_err(|e| {
                GateError::new(ErrorCode::ManifestMalformed, "intents.jsonl is not valid UTF-8")
                    .with_source(e)
            })?
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| {
                    GateError::new(ErrorCode::ManifestMalformed, "intents.jsonl line does not parse")
                        .with_source(e)
                })
            })
            .collect()
    }

    /// Parse `network.har` as JSON.
    pub fn network_har(&self) -> Result<Value, GateError> {
        let bytes = self
            .entry(component_path::NETWORK)
            .ok_or_else(|| GateError::new(ErrorCode::BundleInvalid, "network component missing"))?;
        serde_json::from_slice(bytes).map_err(|e| {
            GateError::new(ErrorCode::ManifestMalformed, "network.har does not parse")
                .with_source(e)
        })
    }
}

fn io_error(e: std::io::Error) -> GateError {
    GateError::new(ErrorCode::BundleInvalid, "bundle I/O failure").with_source(e)
}

/// Build each component's bytes, assign the canonical manifest, and write
/// the resulting bundle to `path`.
pub fn create(path: &Path, input: BundleInput) -> Result<Bundle, GateError> {
    let mut entries: BTreeMap<String, Vec<u8>> = BTreeMap::new();

    entries.insert(
        component_path::ENV.to_string(),
        gate_hash::canonical_bytes(&input.env).map_err(schema_error)?,
    );
    entries.insert(
        component_path::CLOCK.to_string(),
        gate_hash::canonical_bytes(&input.clock).map_err(schema_error)?,
    );
    entries.insert(
        component_path::NETWORK.to_string(),
        gate_hash::canonical_bytes(&input.network).map_err(schema_error)?,
    );

    let mut intents_jsonl = Vec::new();
    for intent in &input.intents {
        let line = gate_hash::canonical_json(intent).map_err(schema_error)?;
        intents_jsonl.extend_from_slice(line.as_bytes());
        intents_jsonl.push(b'\n');
    }
    entries.insert(component_path::INTENTS.to_string(), intents_jsonl);

    let base_tar = write_plain_tar(&input.fs_diff.base)?;
    entries.insert(format!("{}/base.tar", component_path::FS_DIFF), base_tar);
    for (relpath, bytes) in &input.fs_diff.files {
        entries.insert(
            format!("{}/diff/files/{relpath}", component_path::FS_DIFF),
            bytes.clone(),
        );
    }
    entries.insert(
        format!("{}/diff/deleted.json", component_path::FS_DIFF),
        gate_hash::canonical_bytes(&input.fs_diff.deleted).map_err(schema_error)?,
    );

    for (filename, bytes) in &input.logs {
        entries.insert(format!("{}/{filename}", component_path::LOGS), bytes.clone());
    }

    for (index, bytes) in input.prompts.iter().enumerate() {
        entries.insert(format!("{}/{index:04}.json", component_path::PROMPTS), bytes.clone());
    }

    let hashes = recompute_component_hashes(&entries)?;

    let manifest = Manifest {
        version: MANIFEST_VERSION.to_string(),
        created_at: Utc::now(),
        description: input.description,
        metadata: input.metadata,
        files: ManifestFiles {
            env: component_path::ENV.to_string(),
            clock: component_path::CLOCK.to_string(),
            network: component_path::NETWORK.to_string(),
            fs_diff: component_path::FS_DIFF.to_string(),
            logs: component_path::LOGS.to_string(),
            prompts: component_path::PROMPTS.to_string(),
            intents: component_path::INTENTS.to_string(),
        },
        hashes: Some(hashes),
    };

    entries.insert(
        "manifest.json".to_string(),
        gate_hash::canonical_bytes(&manifest).map_err(schema_error)?,
    );

    let bundle = Bundle { manifest, entries };
    bundle.write_to(path)?;
    Ok(bundle)
}

/// Read a gzip-compressed tar at `path`, parse its manifest, and validate it.
pub fn open(path: &Path) -> Result<Bundle, GateError> {
    let file = std::fs::File::open(path).map_err(io_error)?;
    open_reader(file)
}

/// As [`open`], but from any reader — e.g. bytes already held in memory
/// (the Orchestrator re-opens a bundle the Store just handed back without
/// round-tripping through a temp file).
pub fn open_reader<R: Read>(reader: R) -> Result<Bundle, GateError> {
    let entries = read_tar_gz(reader)?;

    let manifest_bytes = entries
        .get("manifest.json")
        .ok_or_else(|| GateError::new(ErrorCode::BundleInvalid, "manifest.json missing"))?;
    let manifest: Manifest = serde_json::from_slice(manifest_bytes).map_err(|e| {
        GateError::new(ErrorCode::ManifestMalformed, "manifest.json does not parse")
            .with_source(e)
    })?;

    let bundle = Bundle { manifest, entries };
    validate(&bundle)?;
    Ok(bundle)
}

/// Check manifest schema, component presence/kind, and (if present)
/// per-component hashes. Fatal on any mismatch — there is no partial open.
pub fn validate(bundle: &Bundle) -> Result<(), GateError> {
    if bundle.manifest.version != MANIFEST_VERSION {
        return Err(GateError::new(ErrorCode::SchemaViolation, "unsupported manifest version")
            .with_context("version", bundle.manifest.version.clone()));
    }

    for component in gate_hash::COMPONENT_ORDER {
        let path = manifest_path_for(component);
        let is_dir = DIR_COMPONENTS.contains(component);
        if is_dir {
            let has_children = bundle.entries_under(path).len();
            if has_children == 0 {
                return Err(GateError::new(ErrorCode::BundleInvalid, "component missing")
                    .with_context("component", *component));
            }
        } else if bundle.entry(path).is_none() {
            return Err(GateError::new(ErrorCode::BundleInvalid, "component missing")
                .with_context("component", *component));
        }
    }

    if let Some(expected) = &bundle.manifest.hashes {
        let actual = recompute_component_hashes(raw_entries(bundle))?;
        for component in gate_hash::COMPONENT_ORDER {
            let exp = expected.get(*component);
            let act = actual.get(*component);
            if exp != act {
                return Err(GateError::new(ErrorCode::BundleInvalid, "component hash mismatch")
                    .with_context("component", *component)
                    .with_context("expected", exp.cloned().unwrap_or_default())
                    .with_context("actual", act.cloned().unwrap_or_default()));
            }
        }
    }

    Ok(())
}

/// Recompute the whole-bundle hash from the bundle's actual current
/// contents, independent of any hashes recorded in its manifest.
pub fn hash(bundle: &Bundle) -> Result<String, GateError> {
    let hashes = recompute_component_hashes(raw_entries(bundle))?;
    let manifest_bytes = gate_hash::canonical_bytes(&bundle.manifest).map_err(schema_error)?;
    gate_hash::bundle_hash(&manifest_bytes, &hashes)
        .ok_or_else(|| GateError::new(ErrorCode::SchemaViolation, "component missing for hashing"))
}

fn raw_entries(bundle: &Bundle) -> &BTreeMap<String, Vec<u8>> {
    &bundle.entries
}

fn recompute_component_hashes(
    entries: &BTreeMap<String, Vec<u8>>,
) -> Result<BTreeMap<String, String>, GateError> {
    let mut hashes = BTreeMap::new();
    for component in gate_hash::COMPONENT_ORDER {
        let path = manifest_path_for(component);
        let hash = if DIR_COMPONENTS.contains(component) {
            let needle = format!("{path}/");
            let children: Vec<(String, Vec<u8>)> = entries
                .iter()
                .filter_map(|(p, bytes)| {
                    p.strip_prefix(&needle).map(|rel| (rel.to_string(), bytes.clone()))
                })
                .collect();
            if children.is_empty() {
                return Err(GateError::new(ErrorCode::BundleInvalid, "component missing")
                    .with_context("component", *component));
            }
            gate_hash::hash_dir_entries(&children)
        } else {
            let bytes = entries.get(path).ok_or_else(|| {
                GateError::new(ErrorCode::BundleInvalid, "component missing")
                    .with_context("component", *component)
            })?;
            gate_hash::sha256_hex(bytes)
        };
        hashes.insert((*component).to_string(), hash);
    }
    Ok(hashes)
}

fn schema_error(e: serde_json::Error) -> GateError {
    GateError::new(ErrorCode::SchemaViolation, "component failed to serialize").with_source(e)
}

fn write_tar_entry<T: Write>(tar: &mut tar::Builder<T>, path: &str, data: &[u8]) -> Result<(), GateError> {
    let mut header = tar::Header::new_gnu();
    header.set_path(path).map_err(io_error)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_cksum();
    tar.append(&header, data).map_err(io_error)?;
    Ok(())
}

/// Write every entry as a deterministic gzip-compressed tar: fixed mode,
/// uid/gid 0, mtime 0, entries in sorted path order, so byte-identical
/// logical contents always produce byte-identical archives.
fn write_tar_gz<W: Write>(w: W, entries: &BTreeMap<String, Vec<u8>>) -> Result<(), GateError> {
    let gz = flate2::GzBuilder::new().mtime(0).write(w, flate2::Compression::default());
    let mut tar = tar::Builder::new(gz);
    tar.mode(tar::HeaderMode::Deterministic);
    for (path, data) in entries {
        write_tar_entry(&mut tar, path, data)?;
    }
    let gz = tar.into_inner().map_err(io_error)?;
    gz.finish().map_err(io_error)?;
    Ok(())
}

/// Same deterministic-header rule as [`write_tar_gz`] but without gzip
/// framing, used for the `fs-diff/base.tar` inner archive.
fn write_plain_tar(entries: &BTreeMap<String, Vec<u8>>) -> Result<Vec<u8>, GateError> {
    let mut buf = Vec::new();
    {
        let mut tar = tar::Builder::new(&mut buf);
        tar.mode(tar::HeaderMode::Deterministic);
        for (path, data) in entries {
            write_tar_entry(&mut tar, path, data)?;
        }
        tar.finish().map_err(io_error)?;
    }
    Ok(buf)
}

fn read_tar_gz<R: Read>(r: R) -> Result<BTreeMap<String, Vec<u8>>, GateError> {
    let gz = flate2::read::GzDecoder::new(r);
    let mut archive = tar::Archive::new(gz);
    let mut entries = BTreeMap::new();
    for entry in archive.entries().map_err(io_error)? {
        let mut entry = entry.map_err(io_error)?;
        let path = entry
            .path()
            .map_err(io_error)?
            .to_string_lossy()
            .into_owned();
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes).map_err(io_error)?;
        entries.insert(path, bytes);
    }
    Ok(entries)
}

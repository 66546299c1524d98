//! Candidate enumeration seam.
//!
//! The engine never touches the target's live environment directly; it asks a
//! [`CandidateProvider`] to list the universe and to isolate a chunk.
//! [`ManifestProvider`] is the file-backed adapter used by the `step` command:
//! the target's scripting layer exports a manifest and applies the keep-list.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crashbisect_error::{BisectError, Result};
use tracing::{debug, info};

use crate::fsio::write_atomic;
use crate::record::CandidateId;

pub trait CandidateProvider {
    /// Ordered universe of candidates in the live environment.
    fn list_candidates(&mut self) -> Result<Vec<CandidateId>>;

    /// Remove every candidate not in `keep` from the live environment.
    fn remove_all_except(&mut self, keep: &[CandidateId]) -> Result<()>;

    /// Human-readable label for `id`; falls back to the raw id.
    fn resolve_label(&self, id: &str) -> String {
        id.to_owned()
    }
}

/// One manifest line: `id` or `id<TAB>label`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub id: CandidateId,
    pub label: Option<String>,
}

/// Parse manifest text. Blank lines and `#` comments are skipped.
pub fn parse_manifest(text: &str) -> std::result::Result<Vec<ManifestEntry>, String> {
    let mut entries = Vec::new();
    for (line_no, raw) in text.lines().enumerate() {
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }
        let (id, label) = match line.split_once('\t') {
            Some((id, label)) => (id.trim(), Some(label.trim())),
            None => (line.trim(), None),
        };
        if id.is_empty() {
            return Err(format!("empty candidate id at line {}", line_no + 1));
        }
        entries.push(ManifestEntry {
            id: id.to_owned(),
            label: label.filter(|l| !l.is_empty()).map(str::to_owned),
        });
    }
    Ok(entries)
}

/// File-backed provider: reads candidates from a manifest and answers
/// `remove_all_except` by writing a keep-list (one id per line).
#[derive(Debug)]
pub struct ManifestProvider {
    manifest_path: PathBuf,
    keep_list_path: PathBuf,
    entries: Vec<ManifestEntry>,
    labels: HashMap<CandidateId, String>,
}

impl ManifestProvider {
    pub fn load(manifest_path: &Path, keep_list_path: &Path) -> Result<Self> {
        let text = fs::read_to_string(manifest_path)?;
        let entries = parse_manifest(&text).map_err(|detail| BisectError::Manifest {
            path: manifest_path.to_path_buf(),
            detail,
        })?;
        let labels = entries
            .iter()
            .filter_map(|e| e.label.clone().map(|label| (e.id.clone(), label)))
            .collect();
        debug!(
            manifest = %manifest_path.display(),
            candidates = entries.len(),
            "candidate manifest loaded"
        );
        Ok(Self {
            manifest_path: manifest_path.to_path_buf(),
            keep_list_path: keep_list_path.to_path_buf(),
            entries,
            labels,
        })
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    pub fn keep_list_path(&self) -> &Path {
        &self.keep_list_path
    }
}

impl CandidateProvider for ManifestProvider {
    fn list_candidates(&mut self) -> Result<Vec<CandidateId>> {
        Ok(self.entries.iter().map(|e| e.id.clone()).collect())
    }

    fn remove_all_except(&mut self, keep: &[CandidateId]) -> Result<()> {
        let mut body = String::new();
        for id in keep {
            body.push_str(id);
            body.push('\n');
        }
        write_atomic(&self.keep_list_path, body.as_bytes())?;
        info!(
            keep_list = %self.keep_list_path.display(),
            kept = keep.len(),
            removed = self.entries.len().saturating_sub(keep.len()),
            "keep-list written"
        );
        Ok(())
    }

    fn resolve_label(&self, id: &str) -> String {
        self.labels
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.to_owned())
    }
}

//! Fault report derived from a finished isolation record.

use serde::{Deserialize, Serialize};

use crate::record::{CandidateId, IsolationRecord};

/// Header line of the plain-text fault export.
pub const FAULT_EXPORT_HEADER: &str = "Crashing candidates:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultEntry {
    pub id: CandidateId,
    pub label: String,
}

/// Confirmed-bad candidates with human-readable labels, in candidate order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FaultReport {
    pub entries: Vec<FaultEntry>,
}

impl FaultReport {
    /// Build the report from `record`, resolving labels through `label_of`.
    pub fn build(record: &IsolationRecord, label_of: impl Fn(&str) -> String) -> Self {
        let mut seen = std::collections::BTreeSet::new();
        let entries = record
            .candidates
            .iter()
            .filter(|id| record.confirmed_bad.contains(id.as_str()))
            .filter(|id| seen.insert(id.as_str()))
            .map(|id| FaultEntry {
                id: id.clone(),
                label: label_of(id),
            })
            .collect();
        Self { entries }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.label.as_str())
    }

    /// Plain-text export: header line, then one label per line.
    #[must_use]
    pub fn render_export(&self) -> String {
        let mut out = String::new();
        out.push_str(FAULT_EXPORT_HEADER);
        out.push('\n');
        for entry in &self.entries {
            out.push_str(&entry.label);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished_record() -> IsolationRecord {
        IsolationRecord {
            candidates: ["a", "b", "c", "d"].iter().map(|s| (*s).to_owned()).collect(),
            confirmed_good: ["a", "c"].iter().map(|s| (*s).to_owned()).collect(),
            confirmed_bad: ["d", "b"].iter().map(|s| (*s).to_owned()).collect(),
            initialized: true,
            finished: true,
            ..IsolationRecord::default()
        }
    }

    #[test]
    fn entries_follow_candidate_order() {
        let report = FaultReport::build(&finished_record(), str::to_owned);
        let ids: Vec<&str> = report.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "d"]);
    }

    #[test]
    fn export_has_header_and_labels() {
        let report = FaultReport::build(&finished_record(), |id| format!("Label_{id}"));
        assert_eq!(
            report.render_export(),
            "Crashing candidates:\nLabel_b\nLabel_d\n"
        );
    }

    #[test]
    fn empty_report_renders_header_only() {
        let report = FaultReport::default();
        assert!(report.is_empty());
        assert_eq!(report.render_export(), "Crashing candidates:\n");
    }
}

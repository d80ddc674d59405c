use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Validation state. Variant order is the merge dominance:
/// `Accepted < Pending < Rejected`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum State {
    Accepted,
    #[default]
    Pending,
    Rejected,
}

/// What a single reporter last said about a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReporterStatus {
    pub state: State,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

impl ReporterStatus {
    pub fn accepted() -> Self { Self { state: State::Accepted, reason: String::new() } }
    pub fn rejected(reason: impl Into<String>) -> Self { Self { state: State::Rejected, reason: reason.into() } }
    pub fn pending(reason: impl Into<String>) -> Self { Self { state: State::Pending, reason: reason.into() } }
}

/// Status persisted alongside a resource's spec. The top-level fields are
/// always derived from `reports`, one entry per reporter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub state: State,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reported_by: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reports: BTreeMap<String, ReporterStatus>,
}

impl Status {
    pub fn accepted(reporter: &str) -> Self { merge_status(None, reporter, ReporterStatus::accepted()) }

    pub fn rejected(reason: impl Into<String>, reporter: &str) -> Self {
        merge_status(None, reporter, ReporterStatus::rejected(reason))
    }

    pub fn pending(reason: impl Into<String>, reporter: &str) -> Self {
        merge_status(None, reporter, ReporterStatus::pending(reason))
    }

    /// Recompute the summary fields from the per-reporter entries.
    pub fn from_reports(reports: BTreeMap<String, ReporterStatus>) -> Self {
        let state = reports.values().map(|r| r.state).max().unwrap_or_default();
        let reported_by = reports
            .iter()
            .find(|(_, r)| r.state == state)
            .map(|(k, _)| k.clone())
            .unwrap_or_default();
        let reason = reports
            .values()
            .filter(|r| !r.reason.is_empty())
            .map(|r| r.reason.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        Status { state, reason, reported_by, reports }
    }

    pub fn for_reporter(&self, reporter: &str) -> Option<&ReporterStatus> { self.reports.get(reporter) }
}

/// Replace `reporter`'s entry in `existing` with `update` and recompute the
/// summary. Reports from different reporters commute; a reporter's newer
/// entry replaces its older one.
pub fn merge_status(existing: Option<&Status>, reporter: &str, update: ReporterStatus) -> Status {
    let mut reports = existing.map(|s| s.reports.clone()).unwrap_or_default();
    reports.insert(reporter.to_string(), update);
    Status::from_reports(reports)
}

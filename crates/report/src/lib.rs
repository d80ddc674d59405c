//! gatesync report: collects per-resource validation results and writes
//! them back as status, merged with what other reporters already wrote.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use gatesync_client::KindRegistry;
use gatesync_core::prelude::*;
use gatesync_core::{merge_status, ReporterStatus};
use metrics::counter;
use tracing::{debug, info, warn};

/// Attempts per resource when the backend reports a version conflict.
const MAX_ATTEMPTS: usize = 3;

/// Validation outcome for one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub pending: Option<String>,
}

impl Report {
    /// Errors reject; otherwise a pending reason holds the resource pending;
    /// otherwise it is accepted, carrying any warnings as the reason.
    pub fn to_status(&self) -> ReporterStatus {
        if !self.errors.is_empty() {
            let mut reason = self.errors.join("; ");
            if !self.warnings.is_empty() {
                reason.push_str("; warnings: ");
                reason.push_str(&self.warnings.join("; "));
            }
            return ReporterStatus::rejected(reason);
        }
        if let Some(why) = &self.pending {
            return ReporterStatus::pending(why.clone());
        }
        ReporterStatus { state: State::Accepted, reason: self.warnings.join("; ") }
    }
}

/// Reports for every resource a validation pass looked at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceReports(BTreeMap<ResourceRef, Report>);

impl ResourceReports {
    pub fn new() -> Self { Self::default() }

    /// Record that `resource` was validated, with no findings yet.
    pub fn accept(&mut self, resource: &Resource) -> &mut Report { self.0.entry(resource.reference()).or_default() }

    pub fn add_error(&mut self, resource: &Resource, err: impl fmt::Display) {
        self.accept(resource).errors.push(err.to_string());
    }

    pub fn add_warning(&mut self, resource: &Resource, warning: impl fmt::Display) {
        self.accept(resource).warnings.push(warning.to_string());
    }

    pub fn mark_pending(&mut self, resource: &Resource, reason: impl fmt::Display) {
        self.accept(resource).pending = Some(reason.to_string());
    }

    pub fn get(&self, r: &ResourceRef) -> Option<&Report> { self.0.get(r) }

    pub fn has_errors(&self) -> bool { self.0.values().any(|r| !r.errors.is_empty()) }

    /// References of rejected resources with their error text.
    pub fn rejected(&self) -> impl Iterator<Item = (&ResourceRef, String)> {
        self.0.iter().filter(|(_, r)| !r.errors.is_empty()).map(|(k, r)| (k, r.errors.join("; ")))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourceRef, &Report)> { self.0.iter() }

    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    /// Fold `other` into `self`, concatenating findings for shared resources.
    pub fn merge(&mut self, other: ResourceReports) {
        for (k, r) in other.0 {
            let e = self.0.entry(k).or_default();
            e.errors.extend(r.errors);
            e.warnings.extend(r.warnings);
            if r.pending.is_some() {
                e.pending = r.pending;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportSummary {
    pub written: usize,
    pub unchanged: usize,
    /// Resources deleted before their status could be written.
    pub missing: usize,
}

#[derive(Debug)]
pub struct ReportFailure {
    pub resource: ResourceRef,
    pub error: ClientError,
}

impl fmt::Display for ReportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}: {}", self.resource, self.error) }
}

#[derive(Debug, thiserror::Error)]
#[error("status report by {reporter}: {} failed: {}", .failures.len(), join_failures(.failures))]
pub struct ReportError {
    pub reporter: String,
    pub summary: ReportSummary,
    pub failures: Vec<ReportFailure>,
}

fn join_failures(failures: &[ReportFailure]) -> String {
    failures.iter().map(|f| f.to_string()).collect::<Vec<_>>().join("; ")
}

enum Outcome {
    Written,
    Unchanged,
    Missing,
}

/// Writes one reporter's view of each resource into its status.
pub struct StatusReporter {
    reporter: String,
    registry: KindRegistry,
}

impl StatusReporter {
    pub fn new(reporter: impl Into<String>, registry: KindRegistry) -> Self {
        Self { reporter: reporter.into(), registry }
    }

    pub fn reporter(&self) -> &str { &self.reporter }

    /// Write every report. A failure on one resource does not stop the rest.
    pub async fn write_reports(&self, reports: &ResourceReports) -> Result<ReportSummary, ReportError> {
        let mut summary = ReportSummary::default();
        let mut failures = Vec::new();
        for (r, report) in reports.iter() {
            match self.write_one(r, report.to_status()).await {
                Ok(Outcome::Written) => summary.written += 1,
                Ok(Outcome::Unchanged) => summary.unchanged += 1,
                Ok(Outcome::Missing) => summary.missing += 1,
                Err(error) => {
                    warn!(reporter = %self.reporter, resource = %r, error = %error, "report: status write failed");
                    failures.push(ReportFailure { resource: r.clone(), error });
                }
            }
        }
        if summary.written > 0 {
            info!(reporter = %self.reporter, written = summary.written, unchanged = summary.unchanged, "report: statuses written");
        }
        if failures.is_empty() {
            Ok(summary)
        } else {
            Err(ReportError { reporter: self.reporter.clone(), summary, failures })
        }
    }

    async fn write_one(&self, r: &ResourceRef, update: ReporterStatus) -> ClientResult<Outcome> {
        let client = self.registry.get(&r.kind)?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            // Re-read so the merge sees statuses written by other reporters.
            let mut current = match client.read(&r.namespace, &r.name, ReadOpts::default()).await {
                Ok(c) => c,
                Err(e) if e.is_not_found() => {
                    debug!(reporter = %self.reporter, resource = %r, "report: resource gone, skipped");
                    return Ok(Outcome::Missing);
                }
                Err(e) => return Err(e),
            };
            let merged = merge_status(current.status.as_ref(), &self.reporter, update.clone());
            if current.status.as_ref() == Some(&merged) {
                counter!("report_skipped", 1u64, "kind" => r.kind.to_string());
                return Ok(Outcome::Unchanged);
            }
            current.status = Some(merged);
            match client.write(current, WriteOpts::overwrite()).await {
                Ok(_) => {
                    counter!("report_writes", 1u64, "kind" => r.kind.to_string());
                    debug!(reporter = %self.reporter, resource = %r, state = ?update.state, "report: status written");
                    return Ok(Outcome::Written);
                }
                Err(e) if e.is_version_conflict() && attempt < MAX_ATTEMPTS => {
                    debug!(reporter = %self.reporter, resource = %r, attempt, "report: version conflict, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

//! Reality checks: compare what a session claims with what the workspace shows.
//!
//! Checks never modify the session or the usage ledger; the only write is the
//! snapshot row. Fixes are applied separately and tracked per snapshot.

pub mod probe;
pub mod scoring;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

use keel_core::ids::{DocumentationId, SessionId, SnapshotId};
use keel_core::project::Documentation;
use keel_core::reality::{
    CheckKind, Discrepancy, DiscrepancyType, FailedFix, FixAction, FixReport, FocusArea,
    MetricStatus, RealitySnapshot, Severity, ValidatedMetric,
};
use keel_core::session::{Session, SessionKind, SessionMetrics};
use keel_core::{KeelError, StateEvent};
use keel_store::{
    CheckpointRepo, Connection, Database, DocumentRepo, RealityRepo, SessionRepo, StoreError, UsageRepo,
};

use crate::{load_session, publish, EVENT_CHANNEL_CAPACITY};
pub use probe::{FsProbe, TestResults, WorkspaceProbe};

#[derive(Clone, Debug, Deserialize)]
pub struct RealityCheck {
    pub session_id: SessionId,
    #[serde(default = "default_kind")]
    pub kind: CheckKind,
    #[serde(default)]
    pub focus_areas: Option<Vec<FocusArea>>,
}

fn default_kind() -> CheckKind {
    CheckKind::Quick
}

#[derive(Clone, Debug, Deserialize)]
pub struct ApplyFixes {
    pub snapshot_id: SnapshotId,
    pub fix_ids: Vec<String>,
    #[serde(default)]
    pub auto_commit: bool,
}

/// Focus areas a check of `kind` covers.
pub fn resolve_focus(kind: CheckKind, requested: Option<Vec<FocusArea>>) -> Result<Vec<FocusArea>, KeelError> {
    let requested: BTreeSet<FocusArea> = requested.unwrap_or_default().into_iter().collect();
    let areas: Vec<FocusArea> = match kind {
        CheckKind::Comprehensive => FocusArea::ALL.to_vec(),
        CheckKind::Quick if requested.is_empty() => vec![FocusArea::Files, FocusArea::Tests],
        CheckKind::Quick => requested.into_iter().collect(),
        CheckKind::Specific if requested.is_empty() => {
            return Err(KeelError::invalid("a specific check needs at least one focus area"));
        }
        CheckKind::Specific => requested.into_iter().collect(),
    };
    Ok(areas)
}

/// Checkpoint labels that name files: they contain a slash or end in an
/// alphanumeric extension.
pub fn looks_like_path(label: &str) -> bool {
    if label.contains(char::is_whitespace) {
        return false;
    }
    label.contains('/')
        || Path::new(label)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
}

/// Numbered discrepancy list (`d1`, `d2`, ...).
#[derive(Default)]
struct Findings(Vec<Discrepancy>);

impl Findings {
    fn push(
        &mut self,
        kind: DiscrepancyType,
        severity: Severity,
        description: String,
        fix: Option<FixAction>,
        auto_fixable: bool,
    ) {
        let id = format!("d{}", self.0.len() + 1);
        self.0.push(Discrepancy {
            id,
            kind,
            severity,
            description,
            fix,
            auto_fixable,
        });
    }
}

/// What the workspace shows for the claims of one session.
struct Observation {
    claimed_files: Vec<String>,
    existing_files: Vec<String>,
    lines: Option<u64>,
    tests: Option<TestResults>,
}

pub struct RealityChecker {
    db: Database,
    probe: Arc<dyn WorkspaceProbe>,
    events: broadcast::Sender<StateEvent>,
}

impl RealityChecker {
    pub fn new(db: Database, probe: Arc<dyn WorkspaceProbe>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { db, probe, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    fn claimed_files(&self, session_id: &SessionId) -> Result<Vec<String>, KeelError> {
        let checkpoints = self
            .db
            .with_conn(|conn| CheckpointRepo::list(conn, session_id))?;
        let mut files: Vec<String> = Vec::new();
        for label in checkpoints.iter().flat_map(|c| &c.completed_components) {
            if looks_like_path(label) && !files.contains(label) {
                files.push(label.clone());
            }
        }
        Ok(files)
    }

    async fn observe(&self, session: &Session, with_tests: bool) -> Result<Observation, KeelError> {
        let claimed_files = self.claimed_files(&session.id)?;
        let mut existing_files = Vec::new();
        for file in &claimed_files {
            if self.probe.exists(file).await {
                existing_files.push(file.clone());
            }
        }

        let lines = match self.probe.added_lines().await {
            Some(added) => Some(added),
            None if existing_files.is_empty() => None,
            None => {
                let mut total = 0;
                for file in &existing_files {
                    total += self.probe.count_lines(file).await.unwrap_or(0);
                }
                Some(total)
            }
        };
        let tests = if with_tests {
            self.probe.test_results().await
        } else {
            None
        };

        Ok(Observation {
            claimed_files,
            existing_files,
            lines,
            tests,
        })
    }

    #[instrument(skip(self, req), fields(session_id = %req.session_id, kind = %req.kind))]
    pub async fn perform_check(&self, req: RealityCheck) -> Result<RealitySnapshot, KeelError> {
        let focus = resolve_focus(req.kind, req.focus_areas)?;
        let session = load_session(&self.db, &req.session_id)?;
        let needs_tests = focus.contains(&FocusArea::Tests) || focus.contains(&FocusArea::Metrics);
        let observed = self.observe(&session, needs_tests).await?;

        let mut findings = Findings::default();
        for area in &focus {
            match area {
                FocusArea::Files => self.check_files(&observed, &mut findings).await,
                FocusArea::Tests => check_tests(&session, &observed, &mut findings),
                FocusArea::Documentation => self.check_docs(&session, &observed, &mut findings).await?,
                FocusArea::Metrics => check_metrics(&session, &observed, &mut findings),
            }
        }

        let discrepancies = findings.0;
        let snapshot = RealitySnapshot {
            id: SnapshotId::new(),
            session_id: session.id.clone(),
            checked_at: Utc::now(),
            kind: req.kind,
            focus_areas: focus,
            confidence: scoring::confidence(&discrepancies),
            recommendations: recommendations(&discrepancies),
            discrepancies,
        };
        self.db.with_conn(|conn| RealityRepo::insert(conn, &snapshot))?;

        info!(
            snapshot_id = %snapshot.id,
            confidence = snapshot.confidence,
            discrepancies = snapshot.discrepancies.len(),
            "reality check complete"
        );
        publish(&self.events, StateEvent::RealityCheckCompleted(Box::new(snapshot.clone())));
        Ok(snapshot)
    }

    async fn check_files(&self, observed: &Observation, findings: &mut Findings) {
        for file in &observed.claimed_files {
            if !observed.existing_files.contains(file) {
                findings.push(
                    DiscrepancyType::FileMismatch,
                    Severity::Critical,
                    format!("{file} was reported as completed but does not exist"),
                    Some(FixAction::RestoreFile { path: file.clone() }),
                    false,
                );
            }
        }
        if let Some(changes) = self.probe.uncommitted_changes().await {
            if !changes.is_empty() {
                findings.push(
                    DiscrepancyType::StateDrift,
                    Severity::Warning,
                    format!("{} file(s) have uncommitted changes", changes.len()),
                    Some(FixAction::CommitChanges { paths: changes }),
                    true,
                );
            }
        }
    }

    /// Latest modification among the claimed code files that still exist.
    async fn latest_code_change(&self, observed: &Observation) -> Option<DateTime<Utc>> {
        let mut latest = None;
        for file in observed.existing_files.iter().filter(|f| !f.ends_with(".md")) {
            latest = latest.max(self.probe.modified(file).await);
        }
        latest
    }

    async fn check_docs(
        &self,
        session: &Session,
        observed: &Observation,
        findings: &mut Findings,
    ) -> Result<(), KeelError> {
        let (tracked, session_docs) = self.db.with_conn(|conn| {
            Ok((
                DocumentRepo::list_for_project(conn, &session.project_id)?,
                DocumentRepo::count_for_session(conn, &session.id)?,
            ))
        })?;

        let code_changed = self.latest_code_change(observed).await;
        let mut tracked_paths = BTreeSet::new();
        let mut stale = Vec::new();
        for doc in &tracked {
            tracked_paths.insert(doc.path.clone());
            if !self.probe.exists(&doc.path).await {
                findings.push(
                    DiscrepancyType::DocumentationGap,
                    Severity::Warning,
                    format!("tracked document {} no longer exists", doc.path),
                    None,
                    false,
                );
                continue;
            }
            let touched = self.probe.modified(&doc.path).await.max(Some(doc.updated_at));
            if code_changed.is_some_and(|code| touched < Some(code)) {
                stale.push(doc.path.clone());
            }
        }
        if !stale.is_empty() {
            findings.push(
                DiscrepancyType::DocumentationGap,
                Severity::Info,
                format!(
                    "{} tracked document(s) predate the latest code change: {}",
                    stale.len(),
                    stale.join(", ")
                ),
                None,
                false,
            );
        }

        let untracked: Vec<String> = self
            .probe
            .list_docs()
            .await
            .into_iter()
            .filter(|path| !tracked_paths.contains(path))
            .collect();
        if !untracked.is_empty() {
            findings.push(
                DiscrepancyType::DocumentationGap,
                Severity::Info,
                format!("{} document(s) in the workspace are not tracked", untracked.len()),
                Some(FixAction::RegisterDocumentation { paths: untracked }),
                true,
            );
        }

        if session.kind == SessionKind::Documentation
            && session_docs == 0
            && session.metrics.docs_written == 0
        {
            findings.push(
                DiscrepancyType::DocumentationGap,
                Severity::Critical,
                "documentation session has produced no documents".to_string(),
                None,
                false,
            );
        }
        Ok(())
    }

    /// Compare reported numbers with what can be observed. Unknown names and
    /// values that cannot be observed here come back as `unverifiable`.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn validate_metrics(
        &self,
        session_id: &SessionId,
        reported: BTreeMap<String, f64>,
    ) -> Result<Vec<ValidatedMetric>, KeelError> {
        let session = load_session(&self.db, session_id)?;
        let wants_tests = reported.contains_key("tests_written");
        let observed = self.observe(&session, wants_tests).await?;
        let (checkpoints, tokens) = self.db.with_conn(|conn| {
            Ok((
                CheckpointRepo::count(conn, session_id)?,
                UsageRepo::sum(conn, session_id)?,
            ))
        })?;

        Ok(reported
            .into_iter()
            .map(|(name, value)| {
                let actual = match name.as_str() {
                    "lines_written" => observed.lines.map(|v| v as f64),
                    "tests_written" => observed.tests.map(|t| t.total() as f64),
                    "files_created" => Some(observed.existing_files.len() as f64),
                    "checkpoints" => Some(checkpoints as f64),
                    "tokens_used" => Some(tokens as f64),
                    _ => None,
                };
                match actual {
                    Some(actual) => {
                        let (variance, status) = scoring::classify(value, actual);
                        ValidatedMetric {
                            name,
                            reported: value,
                            actual: Some(actual),
                            variance: Some(variance),
                            status,
                        }
                    }
                    None => ValidatedMetric {
                        name,
                        reported: value,
                        actual: None,
                        variance: None,
                        status: MetricStatus::Unverifiable,
                    },
                }
            })
            .collect())
    }

    /// Apply auto-fixable fixes from a snapshot. Each fix is applied at most
    /// once per snapshot; the snapshot itself is never rewritten.
    #[instrument(skip(self, req), fields(snapshot_id = %req.snapshot_id))]
    pub async fn apply_fixes(&self, req: ApplyFixes) -> Result<FixReport, KeelError> {
        let snapshot = self
            .db
            .with_conn(|conn| RealityRepo::find(conn, &req.snapshot_id))?
            .ok_or_else(|| KeelError::invalid(format!("unknown snapshot {}", req.snapshot_id)))?;
        let mut applied = self
            .db
            .with_conn(|conn| RealityRepo::applied_fixes(conn, &snapshot.id))?;

        let mut report = FixReport::default();
        let mut session_changed = false;
        let mut docs_changed = false;

        for fix_id in req.fix_ids {
            let outcome = match snapshot.discrepancy(&fix_id) {
                None => Err("unknown discrepancy".to_string()),
                Some(_) if applied.contains(&fix_id) => Err("already applied".to_string()),
                Some(Discrepancy {
                    fix: Some(action),
                    auto_fixable: true,
                    ..
                }) => self.apply_one(&snapshot, &fix_id, action, req.auto_commit).await,
                Some(_) => Err("requires manual action".to_string()),
            };

            match outcome {
                Ok(effect) => {
                    session_changed |= matches!(effect.action, "sync_metrics");
                    docs_changed |= matches!(effect.action, "register_documentation");
                    report.side_effects.push(effect.description);
                    applied.insert(fix_id.clone());
                    report.applied.push(fix_id);
                }
                Err(reason) => report.failed.push(FailedFix { id: fix_id, reason }),
            }
        }

        info!(
            applied = report.applied.len(),
            failed = report.failed.len(),
            "fixes processed"
        );

        if session_changed {
            let session = load_session(&self.db, &snapshot.session_id)?;
            publish(
                &self.events,
                StateEvent::SessionStatusChanged {
                    session: Some(Box::new(session)),
                    previous: None,
                    warning: None,
                },
            );
        }
        if docs_changed {
            let session = load_session(&self.db, &snapshot.session_id)?;
            let documents = self
                .db
                .with_conn(|conn| DocumentRepo::list_for_project(conn, &session.project_id))?;
            publish(
                &self.events,
                StateEvent::DocumentationChanged {
                    project_id: session.project_id,
                    documents,
                },
            );
        }
        publish(
            &self.events,
            StateEvent::FixesApplied {
                snapshot_id: snapshot.id.clone(),
                report: report.clone(),
            },
        );
        Ok(report)
    }

    /// Apply one fix and record it in the same transaction as its writes.
    async fn apply_one(
        &self,
        snapshot: &RealitySnapshot,
        fix_id: &str,
        action: &FixAction,
        auto_commit: bool,
    ) -> Result<FixEffect, String> {
        let db_err = |e: StoreError| match e {
            StoreError::Conflict(_) => "already applied".to_string(),
            other => other.to_string(),
        };
        let record = |conn: &Connection| RealityRepo::record_fix(conn, &snapshot.id, fix_id, "applied");
        match action {
            FixAction::SyncMetrics {
                lines_written,
                tests_written,
            } => {
                let session = load_session(&self.db, &snapshot.session_id).map_err(|e| e.to_string())?;
                let metrics = SessionMetrics {
                    lines_written: *lines_written,
                    tests_written: *tests_written,
                    ..session.metrics
                }
                .with_velocity(session.context_used);
                self.db
                    .with_tx(|conn| {
                        SessionRepo::update_progress(conn, &session.id, &metrics, session.status)?;
                        record(conn)
                    })
                    .map_err(db_err)?;
                Ok(FixEffect {
                    action: action.name(),
                    description: format!(
                        "session metrics synced to {lines_written} lines and {tests_written} tests"
                    ),
                })
            }
            FixAction::RegisterDocumentation { paths } => {
                let session = load_session(&self.db, &snapshot.session_id).map_err(|e| e.to_string())?;
                let now = Utc::now();
                self.db
                    .with_tx(|conn| {
                        for path in paths {
                            DocumentRepo::upsert(
                                conn,
                                &Documentation {
                                    id: DocumentationId::new(),
                                    session_id: Some(session.id.clone()),
                                    project_id: session.project_id.clone(),
                                    path: path.clone(),
                                    doc_type: doc_type_for(path),
                                    updated_at: now,
                                },
                            )?;
                        }
                        record(conn)
                    })
                    .map_err(db_err)?;
                Ok(FixEffect {
                    action: action.name(),
                    description: format!("{} document(s) registered", paths.len()),
                })
            }
            FixAction::CommitChanges { paths } => {
                if !auto_commit {
                    return Err("commit_changes requires auto_commit".into());
                }
                let message = format!("keel: commit changes flagged by reality check {}", snapshot.id);
                if let Err(e) = self.probe.commit(paths, &message).await {
                    warn!(error = %e, "auto-commit failed");
                    return Err(e);
                }
                self.db.with_conn(record).map_err(db_err)?;
                Ok(FixEffect {
                    action: action.name(),
                    description: format!("{} file(s) committed", paths.len()),
                })
            }
            FixAction::RestoreFile { .. } | FixAction::FixTests { .. } => {
                Err("requires manual action".into())
            }
        }
    }
}

struct FixEffect {
    action: &'static str,
    description: String,
}

/// Document type from the file name, used when registering docs.
pub fn doc_type_for(path: &str) -> String {
    let name = Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match name.as_str() {
        "readme" => "readme",
        "changelog" => "changelog",
        "contributing" => "guide",
        _ if path.contains("adr") || path.contains("decisions") => "decision",
        _ if path.contains("api") => "api",
        _ => "markdown",
    }
    .to_string()
}

fn check_tests(session: &Session, observed: &Observation, findings: &mut Findings) {
    if let Some(results) = observed.tests {
        if results.failed > 0 {
            findings.push(
                DiscrepancyType::TestFailure,
                Severity::Critical,
                format!("{} of {} tests fail", results.failed, results.total()),
                Some(FixAction::FixTests {
                    failed: results.failed,
                }),
                false,
            );
        }
    }
    let observable = observed.tests.map(|t| t.total()).unwrap_or(0);
    if session.metrics.tests_written > 0 && observable == 0 {
        findings.push(
            DiscrepancyType::StateDrift,
            Severity::Warning,
            format!(
                "session reports {} tests written but none could be observed",
                session.metrics.tests_written
            ),
            None,
            false,
        );
    }
}

fn check_metrics(session: &Session, observed: &Observation, findings: &mut Findings) {
    let mut drifted = Vec::new();
    let mut lines = session.metrics.lines_written;
    let mut tests = session.metrics.tests_written;

    if let Some(actual) = observed.lines {
        let (variance, status) = scoring::classify(lines as f64, actual as f64);
        if status == MetricStatus::MajorVariance {
            drifted.push(format!(
                "lines_written reported {lines}, observed {actual} ({:.0}% off)",
                variance * 100.0
            ));
            lines = actual;
        }
    }
    if let Some(results) = observed.tests {
        let actual = results.total();
        let (variance, status) = scoring::classify(tests as f64, actual as f64);
        if status == MetricStatus::MajorVariance {
            drifted.push(format!(
                "tests_written reported {tests}, observed {actual} ({:.0}% off)",
                variance * 100.0
            ));
            tests = actual;
        }
    }

    if !drifted.is_empty() {
        findings.push(
            DiscrepancyType::StateDrift,
            Severity::Warning,
            drifted.join("; "),
            Some(FixAction::SyncMetrics {
                lines_written: lines,
                tests_written: tests,
            }),
            true,
        );
    }
}

fn recommendations(discrepancies: &[Discrepancy]) -> Vec<String> {
    if discrepancies.is_empty() {
        return vec!["Workspace matches the reported state".to_string()];
    }
    let mut out: Vec<String> = discrepancies
        .iter()
        .filter_map(|d| match &d.fix {
            Some(FixAction::RestoreFile { path }) => Some(format!("Restore or re-create {path}")),
            Some(FixAction::FixTests { failed }) => {
                Some(format!("Fix the {failed} failing test(s) before the next checkpoint"))
            }
            Some(FixAction::CommitChanges { .. }) => {
                Some("Commit outstanding changes (apply_fixes with auto_commit)".to_string())
            }
            _ => None,
        })
        .collect();
    let auto: Vec<&str> = discrepancies
        .iter()
        .filter(|d| d.auto_fixable)
        .map(|d| d.id.as_str())
        .collect();
    if !auto.is_empty() {
        out.push(format!("Run apply_fixes with [{}] to resolve auto-fixable items", auto.join(", ")));
    }
    out
}

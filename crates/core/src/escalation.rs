use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use crate::chain::Stage;
use crate::domain::request::{AssetRequest, RequestId};
use crate::store::RequestStore;
use crate::workflow::{ApprovalEngine, EscalationOutcome};

/// Outcome counts for one sweep. Per-request failures never abort the
/// batch; they are counted here and retried on the next cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub escalated: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Scans stalled requests and force-advances those whose SLA window has
/// elapsed. Driven by a periodic host task in production and called
/// directly with a pinned `now` in tests.
pub struct EscalationSweeper<R, S> {
    requests: Arc<R>,
    engine: ApprovalEngine,
    audit: Arc<S>,
    stages: Vec<Stage>,
}

impl<R, S> EscalationSweeper<R, S>
where
    R: RequestStore,
    S: AuditSink,
{
    pub fn new(requests: Arc<R>, engine: ApprovalEngine, audit: Arc<S>) -> Self {
        let stages = engine.chain().escalatable_stages();
        Self { requests, engine, audit, stages }
    }

    /// Restricts the sweep to an explicit stage set. Stages outside the
    /// engine's chain are ignored at scan time.
    pub fn with_stages(mut self, stages: Vec<Stage>) -> Self {
        if !stages.is_empty() {
            self.stages = stages;
        }
        self
    }

    pub async fn run_sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        let candidates = match self.requests.list_escalation_candidates(&self.stages).await {
            Ok(candidates) => candidates,
            Err(error) => {
                report.failed += 1;
                self.audit.emit(
                    AuditEvent::new(
                        None,
                        "escalation-sweep",
                        "escalation.scan_failed",
                        AuditCategory::Escalation,
                        "escalation-sweeper",
                        AuditOutcome::Failed,
                    )
                    .with_metadata("error", error.to_string()),
                );
                return report;
            }
        };
        report.scanned = candidates.len();

        for request in candidates {
            self.escalate_one(request, now, &mut report).await;
        }

        report
    }

    async fn escalate_one(
        &self,
        mut request: AssetRequest,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) {
        let window = Duration::hours(request.escalation.escalate_after_hours);
        if now - request.escalation.last_action_at < window {
            report.skipped += 1;
            return;
        }

        let request_id = request.id.clone();
        let expected = request.current_level;

        match self.engine.escalate(&mut request, now) {
            Ok(EscalationOutcome::Escalated { from, to }) => {
                match self.requests.update_if_level(&expected, request).await {
                    Ok(true) => {
                        report.escalated += 1;
                        self.audit.emit(
                            AuditEvent::new(
                                Some(request_id),
                                "escalation-sweep",
                                "escalation.stage_skipped",
                                AuditCategory::Escalation,
                                "escalation-sweeper",
                                AuditOutcome::Success,
                            )
                            .with_metadata("from", from.as_str())
                            .with_metadata("to", to.as_str()),
                        );
                    }
                    // A human decision landed first; their write wins and
                    // the request is reconsidered next cycle.
                    Ok(false) => report.skipped += 1,
                    Err(error) => {
                        report.failed += 1;
                        self.emit_failure(request_id, error.to_string());
                    }
                }
            }
            Ok(EscalationOutcome::NotEscalatable { .. })
            | Ok(EscalationOutcome::AlreadyTerminal) => report.skipped += 1,
            Err(error) => {
                report.failed += 1;
                self.emit_failure(request_id, error.to_string());
            }
        }
    }

    fn emit_failure(&self, request_id: RequestId, error: String) {
        self.audit.emit(
            AuditEvent::new(
                Some(request_id),
                "escalation-sweep",
                "escalation.failed",
                AuditCategory::Escalation,
                "escalation-sweeper",
                AuditOutcome::Failed,
            )
            .with_metadata("error", error),
        );
    }
}

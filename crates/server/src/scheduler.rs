use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use wardflow_core::audit::AuditSink;
use wardflow_core::escalation::EscalationSweeper;
use wardflow_core::store::RequestStore;

/// Runs the escalation sweep on a fixed ticker until the shutdown channel
/// flips. Each sweep is independent; a failing cycle is logged and the next
/// tick retries from scratch.
pub fn spawn<R, S>(
    sweeper: Arc<EscalationSweeper<R, S>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    R: RequestStore + 'static,
    S: AuditSink + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            event_name = "system.scheduler.started",
            correlation_id = "escalation-sweep",
            interval_secs = interval.as_secs(),
            "escalation scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = sweeper.run_sweep(Utc::now()).await;
                    if report.failed > 0 {
                        warn!(
                            event_name = "system.scheduler.sweep_completed_with_failures",
                            correlation_id = "escalation-sweep",
                            scanned = report.scanned,
                            escalated = report.escalated,
                            skipped = report.skipped,
                            failed = report.failed,
                            "escalation sweep completed with failures"
                        );
                    } else {
                        info!(
                            event_name = "system.scheduler.sweep_completed",
                            correlation_id = "escalation-sweep",
                            scanned = report.scanned,
                            escalated = report.escalated,
                            skipped = report.skipped,
                            "escalation sweep completed"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(
                            event_name = "system.scheduler.stopped",
                            correlation_id = "escalation-sweep",
                            "escalation scheduler stopping"
                        );
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use tokio::sync::watch;

    use wardflow_core::audit::InMemoryAuditSink;
    use wardflow_core::chain::Stage;
    use wardflow_core::domain::request::{
        AssetRequest, Priority, RequestId, RequestLevel, RequestMode, RequestScope, RequestSeed,
        RequestType, ScopeLevel,
    };
    use wardflow_core::domain::{DepartmentId, HospitalId, OrganizationId};
    use wardflow_core::escalation::EscalationSweeper;
    use wardflow_core::store::memory::InMemoryRequestStore;
    use wardflow_core::store::RequestStore;
    use wardflow_core::workflow::ApprovalEngine;

    fn overdue_request(id: &str) -> AssetRequest {
        let now = Utc::now();
        let mut request = AssetRequest::create(
            RequestSeed {
                id: RequestId(id.to_string()),
                request_type: RequestType::Procurement,
                mode: RequestMode::Count(1),
                scope: RequestScope {
                    level: ScopeLevel::SameHospital,
                    department_id: DepartmentId("dept-icu".to_string()),
                    hospital_id: HospitalId("hosp-1".to_string()),
                    organization_id: OrganizationId("org-1".to_string()),
                },
                justification: "test".to_string(),
                priority: Priority::Medium,
                estimated_cost: None,
                requested_by: "user-req".to_string(),
                escalation_enabled: true,
                escalate_after_hours: 24,
            },
            Stage::Level1,
            &[Stage::Level1, Stage::Hod, Stage::Cfo],
            now,
        )
        .expect("valid request");
        request.escalation.last_action_at = now - chrono::Duration::hours(48);
        request
    }

    #[tokio::test]
    async fn ticker_escalates_overdue_requests_and_stops_on_shutdown() {
        let store = Arc::new(InMemoryRequestStore::default());
        store.insert(overdue_request("REQ-1")).await.expect("insert");

        let sweeper = Arc::new(EscalationSweeper::new(
            store.clone(),
            ApprovalEngine::canonical(),
            Arc::new(InMemoryAuditSink::default()),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = super::spawn(sweeper, Duration::from_millis(10), shutdown_rx);

        // Give the first tick room to land.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stored = store
            .find_by_id(&RequestId("REQ-1".to_string()))
            .await
            .expect("find")
            .expect("exists");
        assert_eq!(stored.current_level, RequestLevel::Stage(Stage::Hod));

        shutdown_tx.send(true).expect("signal shutdown");
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler should stop promptly")
            .expect("scheduler task should not panic");
    }

    #[tokio::test]
    async fn dropping_the_shutdown_sender_also_stops_the_scheduler() {
        let sweeper = Arc::new(EscalationSweeper::new(
            Arc::new(InMemoryRequestStore::default()),
            ApprovalEngine::canonical(),
            Arc::new(InMemoryAuditSink::default()),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = super::spawn(sweeper, Duration::from_millis(10), shutdown_rx);
        drop(shutdown_tx);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler should stop when the sender is gone")
            .expect("scheduler task should not panic");
    }
}

//! Reconciliation of scheduling faults into history rows.
//!
//! A job body that dies outside the login engine leaves its attempt without
//! a terminal row. Each [`SchedulingFault`] either fails the IN_PROGRESS row
//! the attempt wrote, or, if it never got that far, records one new FAILED
//! row. Every scheduled attempt thus ends with exactly one terminal record.

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::SchedulingFault;
use crate::model::{ActionHistory, NewHistory};
use crate::storage::{Store, StoreError, StoreResult};

/// Write the terminal row for one faulted attempt.
pub fn reconcile(store: &Store, fault: &SchedulingFault) -> StoreResult<ActionHistory> {
    let message = Some(format!("Scheduled attempt failed: {}", fault.reason));
    if let Some(row) = store.fail_in_progress(fault.site_id, fault.started_at, message.clone())? {
        return Ok(row);
    }
    store.insert_history(
        fault.site_id,
        NewHistory::crashed(fault.started_at, Utc::now(), message),
    )
}

/// Drain the fault channel until every sender is gone.
pub async fn run_reconciler(store: Store, mut faults: mpsc::UnboundedReceiver<SchedulingFault>) {
    while let Some(fault) = faults.recv().await {
        match reconcile(&store, &fault) {
            Ok(row) => info!(
                site_id = fault.site_id,
                history_id = row.id,
                "faulted attempt recorded as failed"
            ),
            Err(StoreError::SiteNotFound(_)) => {
                warn!(site_id = fault.site_id, "faulted attempt belongs to a deleted site")
            }
            Err(e) => error!(site_id = fault.site_id, error = %e, "could not reconcile faulted attempt"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::model::{ActionStatus, Credentials, LoginStatus, NewSite};
    use crate::policy::SchedulePolicy;
    use tempfile::TempDir;

    fn store_with_site() -> (TempDir, Store, i64) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("faults.db"), EventBus::default()).unwrap();
        let site = store
            .add_site(NewSite {
                name: "bank".into(),
                url: "https://bank.example/login".into(),
                success_url: "https://bank.example/home".into(),
                credentials: Credentials::new("bob", "secret"),
                take_screenshot: false,
                paused: false,
                custom_script: None,
                policy: SchedulePolicy::every_days(2),
            })
            .unwrap();
        (dir, store, site.id)
    }

    #[test]
    fn test_fault_fails_in_progress_row() {
        let (_dir, store, site_id) = store_with_site();
        let started = Utc::now();
        let row = store
            .insert_history(site_id, NewHistory::in_progress(started, None))
            .unwrap();

        let fault = SchedulingFault {
            site_id,
            started_at: started,
            reason: "worker panicked".into(),
        };
        let reconciled = reconcile(&store, &fault).unwrap();

        assert_eq!(reconciled.id, row.id);
        assert_eq!(reconciled.status, ActionStatus::Failed);
        assert_eq!(reconciled.failure, Some(LoginStatus::UnknownExecutionError));
        assert!(reconciled.message.unwrap().contains("worker panicked"));
        assert_eq!(store.history_for_site(site_id, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_fault_without_row_creates_one() {
        let (_dir, store, site_id) = store_with_site();
        let fault = SchedulingFault {
            site_id,
            started_at: Utc::now(),
            reason: "database is locked".into(),
        };
        reconcile(&store, &fault).unwrap();

        let rows = store.history_for_site(site_id, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, ActionStatus::Failed);
        assert_eq!(rows[0].failure, Some(LoginStatus::UnknownExecutionError));
        assert!(rows[0].execution_ended.is_some());
    }

    #[test]
    fn test_fault_for_deleted_site() {
        let (_dir, store, site_id) = store_with_site();
        store.delete_site(site_id).unwrap();
        let fault = SchedulingFault {
            site_id,
            started_at: Utc::now(),
            reason: "gone".into(),
        };
        assert!(matches!(reconcile(&store, &fault), Err(StoreError::SiteNotFound(_))));
    }
}

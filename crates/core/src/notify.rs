use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::request::{RequestId, RequestLevel};

/// Emitted whenever a request moves between stages or reaches a terminal
/// level. Consumed by out-of-process notifiers (email, pagers); delivery is
/// best-effort and must never gate the transition itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageChangeNotice {
    pub request_id: RequestId,
    pub from: RequestLevel,
    pub to: RequestLevel,
    pub actor: String,
    pub occurred_at: DateTime<Utc>,
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, notice: StageChangeNotice);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopNotificationSink;

impl NotificationSink for NoopNotificationSink {
    fn notify(&self, _notice: StageChangeNotice) {}
}

#[derive(Clone, Default)]
pub struct InMemoryNotificationSink {
    notices: Arc<Mutex<Vec<StageChangeNotice>>>,
}

impl InMemoryNotificationSink {
    pub fn notices(&self) -> Vec<StageChangeNotice> {
        match self.notices.lock() {
            Ok(notices) => notices.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl NotificationSink for InMemoryNotificationSink {
    fn notify(&self, notice: StageChangeNotice) {
        match self.notices.lock() {
            Ok(mut notices) => notices.push(notice),
            Err(poisoned) => poisoned.into_inner().push(notice),
        }
    }
}

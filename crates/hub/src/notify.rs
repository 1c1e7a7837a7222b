//! Fire-and-forget user notifications (the toast surface).

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Success,
    Error,
    Info,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub pond_id: String,
    pub message: String,
}

impl Notice {
    pub fn success(pond_id: &str, message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Success, pond_id, message)
    }

    pub fn error(pond_id: &str, message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Error, pond_id, message)
    }

    pub fn info(pond_id: &str, message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Info, pond_id, message)
    }

    fn new(level: NoticeLevel, pond_id: &str, message: impl Into<String>) -> Self {
        Self {
            level,
            pond_id: pond_id.to_string(),
            message: message.into(),
        }
    }
}

/// No acknowledgement flows back to the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: Notice);
}

pub type SharedNotifier = Arc<dyn Notifier>;

/// Collects notices for assertions.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    notices: std::sync::Mutex<Vec<Notice>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub(crate) fn all(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, level: NoticeLevel) -> usize {
        self.notices
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.level == level)
            .count()
    }
}

#[cfg(test)]
#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notice: Notice) {
        self.notices.lock().unwrap().push(notice);
    }
}

//! Transient, human-readable notices for the host UI.
//!
//! Only user-initiated operations produce these. Background sync failures are
//! logged and retried on the next tick instead.

use crate::error::SyncError;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    /// A user action (mark read, refresh) failed on the server.
    ActionFailed,
    /// Something escaped every other handler; the app keeps running.
    Unexpected,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct UserNotice {
    pub kind: NoticeKind,
    pub message: String,
}

impl UserNotice {
    /// Builds the notice for a failed user action and logs the cause.
    pub fn action_failed(action: &str, err: &SyncError) -> Self {
        warn!(error = %err, action, "User action failed");
        Self {
            kind: NoticeKind::ActionFailed,
            message: format!("Could not {}. Please try again.", action),
        }
    }

    pub fn unexpected() -> Self {
        Self {
            kind: NoticeKind::Unexpected,
            message: "Something went wrong. Please try again.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_failed_hides_transport_details() {
        let err = SyncError::Status {
            status: 500,
            url: "http://localhost/notifications/1/read".to_string(),
        };
        let notice = UserNotice::action_failed("mark notification as read", &err);
        assert_eq!(notice.kind, NoticeKind::ActionFailed);
        assert_eq!(
            notice.to_string(),
            "Could not mark notification as read. Please try again."
        );
        assert!(!notice.message.contains("500"));
    }
}

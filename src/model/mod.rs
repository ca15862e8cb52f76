//! Store-level records: events, reconciler commit statuses and users.

mod event;
mod gitops_commit;
mod user;

pub use event::{Event, EventType, STATUS_ERROR, STATUS_NEW, STATUS_PROCESSED};
pub use gitops_commit::{
    GitopsCommit, HEALTH_CHECK_FAILED, PROGRESSING, RECONCILIATION_FAILED,
    RECONCILIATION_SUCCEEDED, VALIDATION_FAILED,
};
pub use user::User;

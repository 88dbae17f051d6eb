use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

/// Version tag for the shared domain contract, carried in service envelopes.
pub const CORE_CONTRACT_VERSION: &str = "core.v1";

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("allocation contention: creation transaction must be retried")]
    AllocationContention,
    #[error("version conflict on {record_id}: expected {expected}, current {current}")]
    Conflict { record_id: ComplaintId, expected: i64, current: i64 },
    #[error("complaint not found: {0}")]
    NotFound(ComplaintId),
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("replay mismatch: local id {local_id} was applied with a different payload")]
    ReplayMismatch { local_id: LocalId },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ComplaintId(pub Ulid);

impl ComplaintId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ComplaintId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ComplaintId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ActorId(pub Ulid);

impl ActorId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ActorId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ActorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NotificationId(pub Ulid);

impl NotificationId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for NotificationId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for NotificationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-generated correlation token for one queued mutation. Distinct from
/// the store-assigned record id; the server keys idempotent replay on it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct LocalId(pub Ulid);

impl LocalId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for LocalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Staff,
    Field,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Staff => "staff",
            Self::Field => "field",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "staff" => Some(Self::Staff),
            "field" => Some(Self::Field),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Actor {
    pub id: ActorId,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ComplaintStatus {
    New,
    InProgress,
    Resolved,
    Closed,
}

impl ComplaintStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::InProgress => "in-progress",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "new" => Some(Self::New),
            "in-progress" => Some(Self::InProgress),
            "resolved" => Some(Self::Resolved),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// One complaint record. `sequence_number` is unique and monotonically
/// assigned within `year_key`; `version` increments on every committed write
/// and anchors optimistic-concurrency detection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Complaint {
    pub id: ComplaintId,
    pub year_key: String,
    pub sequence_number: i64,
    pub summary: String,
    pub status: ComplaintStatus,
    pub priority: Priority,
    pub owner_id: Option<ActorId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateComplaint {
    pub summary: String,
    pub priority: Priority,
    /// Business date the complaint was received; its year becomes `year_key`.
    pub business_date: time::Date,
}

impl CreateComplaint {
    /// Validate creation input before it reaches the store.
    ///
    /// # Errors
    /// Returns `SyncError::Validation` when the summary is blank.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.summary.trim().is_empty() {
            return Err(SyncError::Validation("summary must not be blank".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn year_key(&self) -> String {
        self.business_date.year().to_string()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComplaintPatch {
    pub summary: Option<String>,
    pub status: Option<ComplaintStatus>,
    pub priority: Option<Priority>,
}

impl ComplaintPatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.summary.is_none() && self.status.is_none() && self.priority.is_none()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl ChangeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

/// Ephemeral record-change event. Never persisted; lives on the wire between
/// the store and the bus, and briefly in the bus lookback ring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeEvent {
    pub record_id: ComplaintId,
    pub kind: ChangeKind,
    /// Post-write snapshot; `None` for deletions.
    pub snapshot: Option<Complaint>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationCategory {
    NewRecord,
    StatusUpdate,
    PriorityUpdate,
}

impl NotificationCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewRecord => "new_record",
            Self::StatusUpdate => "status_update",
            Self::PriorityUpdate => "priority_update",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "new_record" => Some(Self::NewRecord),
            "status_update" => Some(Self::StatusUpdate),
            "priority_update" => Some(Self::PriorityUpdate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationEvent {
    pub id: NotificationId,
    pub recipient_id: ActorId,
    pub record_id: ComplaintId,
    pub title: String,
    pub message: String,
    pub category: NotificationCategory,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub read: bool,
}

/// Policy output before the store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationDraft {
    pub recipient_id: ActorId,
    pub record_id: ComplaintId,
    pub title: String,
    pub message: String,
    pub category: NotificationCategory,
}

/// One framed message on a subscriber connection: `{type, payload}` with
/// `type` either `record_changed` or `notification`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Frame {
    RecordChanged { seq: u64, change: ChangeEvent },
    Notification(NotificationEvent),
}

/// Derive the notification events owed for one committed transition.
///
/// Pure function over `(previous, next, actor)` plus the current staff
/// roster. Rules, first match per dimension, dimensions independent:
/// field-actor creation fans out `new_record` to every staff recipient;
/// a staff actor changing status or priority of a record owned by a
/// different field actor notifies the owner; deletions are silent; an actor
/// is never notified about their own mutation.
#[must_use]
pub fn derive_notifications(
    previous: Option<&Complaint>,
    next: Option<&Complaint>,
    actor: Actor,
    staff_recipients: &[ActorId],
) -> Vec<NotificationDraft> {
    let Some(next) = next else {
        // Deletion: silent.
        return Vec::new();
    };

    let mut drafts = Vec::new();

    match previous {
        None => {
            if actor.role == Role::Field {
                for recipient in staff_recipients {
                    if *recipient == actor.id {
                        continue;
                    }
                    drafts.push(NotificationDraft {
                        recipient_id: *recipient,
                        record_id: next.id,
                        title: "New Complaint Received".to_string(),
                        message: format!(
                            "New complaint #{} submitted from the field: {}",
                            next.sequence_number, next.summary
                        ),
                        category: NotificationCategory::NewRecord,
                    });
                }
            }
        }
        Some(previous) => {
            let notifiable_owner = match next.owner_id {
                Some(owner) if actor.role == Role::Staff && owner != actor.id => Some(owner),
                _ => None,
            };

            if let Some(owner) = notifiable_owner {
                if previous.status != next.status {
                    drafts.push(NotificationDraft {
                        recipient_id: owner,
                        record_id: next.id,
                        title: "Complaint Status Updated".to_string(),
                        message: format!(
                            "Complaint #{} status changed from {} to {}",
                            next.sequence_number,
                            previous.status.as_str(),
                            next.status.as_str()
                        ),
                        category: NotificationCategory::StatusUpdate,
                    });
                }
                if previous.priority != next.priority {
                    drafts.push(NotificationDraft {
                        recipient_id: owner,
                        record_id: next.id,
                        title: "Complaint Priority Updated".to_string(),
                        message: format!(
                            "Complaint #{} priority changed from {} to {}",
                            next.sequence_number,
                            previous.priority.as_str(),
                            next.priority.as_str()
                        ),
                        category: NotificationCategory::PriorityUpdate,
                    });
                }
            }
        }
    }

    drafts
}

use std::path::Path;

use caseflow_core::{
    derive_notifications, Actor, ActorId, ChangeEvent, ChangeKind, Complaint, ComplaintId,
    ComplaintPatch, ComplaintStatus, CreateComplaint, LocalId, NotificationDraft,
    NotificationEvent, NotificationId, Priority, Role, SyncError,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

/// Bound on whole-creation retries when the write lock cannot be admitted.
const CREATE_CONTENTION_RETRIES: usize = 3;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS complaints (
  id TEXT PRIMARY KEY,
  year_key TEXT NOT NULL,
  sequence_number INTEGER NOT NULL CHECK (sequence_number >= 1),
  summary TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('new','in-progress','resolved','closed')),
  priority TEXT NOT NULL CHECK (priority IN ('low','medium','high')),
  owner_id TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  version INTEGER NOT NULL CHECK (version >= 1),
  UNIQUE(year_key, sequence_number)
);

CREATE TABLE IF NOT EXISTS year_sequences (
  year_key TEXT PRIMARY KEY,
  last_value INTEGER NOT NULL CHECK (last_value >= 1)
);

CREATE TABLE IF NOT EXISTS notifications (
  id TEXT PRIMARY KEY,
  recipient_id TEXT NOT NULL,
  record_id TEXT NOT NULL,
  title TEXT NOT NULL,
  message TEXT NOT NULL,
  category TEXT NOT NULL CHECK (category IN ('new_record','status_update','priority_update')),
  created_at TEXT NOT NULL,
  is_read INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS applied_mutations (
  local_id TEXT PRIMARY KEY,
  actor_id TEXT NOT NULL,
  payload_digest TEXT NOT NULL,
  record_json TEXT,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS actors (
  id TEXT PRIMARY KEY,
  role TEXT NOT NULL CHECK (role IN ('staff','field'))
);

CREATE INDEX IF NOT EXISTS idx_complaints_year_seq ON complaints(year_key, sequence_number);
CREATE INDEX IF NOT EXISTS idx_complaints_status ON complaints(status);
CREATE INDEX IF NOT EXISTS idx_notifications_recipient ON notifications(recipient_id, is_read);
";

/// Result of one committed mutation. The caller publishes `change` and
/// `notifications` to the bus strictly after this value is returned, so no
/// event ever precedes its transaction's durability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    /// Post-write record; `None` after a delete.
    pub record: Option<Complaint>,
    /// Pre-write record; `None` after a create.
    pub prior: Option<Complaint>,
    /// `None` only when the mutation was an idempotent replay hit.
    pub change: Option<ChangeEvent>,
    pub notifications: Vec<NotificationEvent>,
    /// True when a previously-succeeded `local_id` short-circuited the write.
    pub already_applied: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComplaintStats {
    pub total: u64,
    pub new: u64,
    pub in_progress: u64,
    pub resolved: u64,
    pub closed: u64,
}

pub struct SqliteChangeStore {
    conn: Connection,
}

impl SqliteChangeStore {
    /// Open a SQLite-backed change store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(path: &Path) -> Result<Self, SyncError> {
        let conn = Connection::open(path).map_err(|err| {
            SyncError::Storage(format!("failed to open sqlite database at {}: {err}", path.display()))
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(storage("failed to configure sqlite pragmas"))?;

        Ok(Self { conn })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<(), SyncError> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .map_err(storage("failed to apply schema_migrations table"))?;

        let version = current_schema_version(&self.conn)?;
        if version == 0 {
            self.conn
                .execute_batch(MIGRATION_001_SQL)
                .map_err(storage("failed to apply migration v1"))?;
            record_schema_version(&self.conn, 1)?;
        } else if version != LATEST_SCHEMA_VERSION {
            return Err(SyncError::Storage(format!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            )));
        }

        Ok(())
    }

    /// Create a complaint, allocating its per-year sequence number and
    /// queueing policy notifications in the same transaction.
    ///
    /// The transaction is opened `IMMEDIATE`, so the write lock is taken at
    /// admission and sequence numbers follow admission order. A contended
    /// admission is retried as a whole up to a small bound; every retry
    /// allocates a fresh number and abandoned numbers stay as gaps.
    ///
    /// # Errors
    /// `Validation` for blank input, `AllocationContention` when the bounded
    /// retry is exhausted, `ReplayMismatch` when `local_id` was applied with
    /// a different payload, `Storage` for everything else.
    pub fn create(
        &mut self,
        input: &CreateComplaint,
        actor: Actor,
        local_id: Option<LocalId>,
    ) -> Result<Committed, SyncError> {
        input.validate()?;

        let mut attempt = 0;
        loop {
            match self.create_once(input, actor, local_id) {
                Err(SyncError::AllocationContention) if attempt + 1 < CREATE_CONTENTION_RETRIES => {
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn create_once(
        &mut self,
        input: &CreateComplaint,
        actor: Actor,
        local_id: Option<LocalId>,
    ) -> Result<Committed, SyncError> {
        let digest = create_digest(input, actor)?;
        let tx = self.begin_immediate()?;

        if let Some(local_id) = local_id {
            if let Some(hit) = replay_hit(&tx, local_id, &digest)? {
                tx.commit().map_err(commit_err)?;
                return Ok(hit);
            }
        }

        let now = OffsetDateTime::now_utc();
        let year_key = input.year_key();
        let sequence_number = allocate_sequence(&tx, &year_key)?;

        let record = Complaint {
            id: ComplaintId::new(),
            year_key,
            sequence_number,
            summary: input.summary.clone(),
            status: ComplaintStatus::New,
            priority: input.priority,
            owner_id: (actor.role == Role::Field).then_some(actor.id),
            created_at: now,
            updated_at: now,
            version: 1,
        };

        tx.execute(
            "INSERT INTO complaints(
                id, year_key, sequence_number, summary, status, priority,
                owner_id, created_at, updated_at, version
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.id.to_string(),
                record.year_key,
                record.sequence_number,
                record.summary,
                record.status.as_str(),
                record.priority.as_str(),
                record.owner_id.map(|id| id.to_string()),
                rfc3339(record.created_at)?,
                rfc3339(record.updated_at)?,
                record.version,
            ],
        )
        .map_err(storage("failed to insert complaint"))?;

        let staff = staff_recipients_tx(&tx)?;
        let drafts = derive_notifications(None, Some(&record), actor, &staff);
        let notifications = insert_notifications(&tx, drafts, now)?;

        if let Some(local_id) = local_id {
            record_applied(&tx, local_id, actor, &digest, Some(&record), now)?;
        }

        tx.commit().map_err(commit_err)?;

        Ok(Committed {
            change: Some(ChangeEvent {
                record_id: record.id,
                kind: ChangeKind::Created,
                snapshot: Some(record.clone()),
            }),
            record: Some(record),
            prior: None,
            notifications,
            already_applied: false,
        })
    }

    /// Apply a partial update inside one transaction, with optional
    /// optimistic-concurrency check and idempotent replay.
    ///
    /// # Errors
    /// `NotFound` when the record does not exist, `Conflict` when
    /// `expected_version` is stale (carrying both versions), `ReplayMismatch`
    /// on a diverging replay, `Validation` for an empty patch, `Storage`
    /// otherwise.
    pub fn update(
        &mut self,
        id: ComplaintId,
        patch: &ComplaintPatch,
        actor: Actor,
        expected_version: Option<i64>,
        local_id: Option<LocalId>,
    ) -> Result<Committed, SyncError> {
        if patch.is_empty() {
            return Err(SyncError::Validation("update patch must change at least one field".to_string()));
        }

        let digest = update_digest(id, patch, expected_version, actor)?;
        let tx = self.begin_immediate()?;

        if let Some(local_id) = local_id {
            if let Some(hit) = replay_hit(&tx, local_id, &digest)? {
                tx.commit().map_err(commit_err)?;
                return Ok(hit);
            }
        }

        let prior = get_complaint_tx(&tx, id)?.ok_or(SyncError::NotFound(id))?;

        if let Some(expected) = expected_version {
            if expected != prior.version {
                return Err(SyncError::Conflict {
                    record_id: id,
                    expected,
                    current: prior.version,
                });
            }
        }

        let now = OffsetDateTime::now_utc();
        let mut next = prior.clone();
        if let Some(summary) = &patch.summary {
            next.summary.clone_from(summary);
        }
        if let Some(status) = patch.status {
            next.status = status;
        }
        if let Some(priority) = patch.priority {
            next.priority = priority;
        }
        next.version = prior.version + 1;
        next.updated_at = now;

        tx.execute(
            "UPDATE complaints
             SET summary = ?1, status = ?2, priority = ?3, updated_at = ?4, version = ?5
             WHERE id = ?6",
            params![
                next.summary,
                next.status.as_str(),
                next.priority.as_str(),
                rfc3339(now)?,
                next.version,
                id.to_string(),
            ],
        )
        .map_err(storage("failed to update complaint"))?;

        let drafts = derive_notifications(Some(&prior), Some(&next), actor, &[]);
        let notifications = insert_notifications(&tx, drafts, now)?;

        if let Some(local_id) = local_id {
            record_applied(&tx, local_id, actor, &digest, Some(&next), now)?;
        }

        tx.commit().map_err(commit_err)?;

        Ok(Committed {
            change: Some(ChangeEvent {
                record_id: next.id,
                kind: ChangeKind::Updated,
                snapshot: Some(next.clone()),
            }),
            record: Some(next),
            prior: Some(prior),
            notifications,
            already_applied: false,
        })
    }

    /// Hard-delete a record. Administrative path: silent notification-wise,
    /// but still emits a `deleted` change event so live clients evict it.
    ///
    /// # Errors
    /// `NotFound` when the record does not exist, `ReplayMismatch` on a
    /// diverging replay, `Storage` otherwise.
    pub fn delete(
        &mut self,
        id: ComplaintId,
        actor: Actor,
        local_id: Option<LocalId>,
    ) -> Result<Committed, SyncError> {
        let digest = delete_digest(id, actor)?;
        let tx = self.begin_immediate()?;

        if let Some(local_id) = local_id {
            if let Some(mut hit) = replay_hit(&tx, local_id, &digest)? {
                tx.commit().map_err(commit_err)?;
                // The stored snapshot is the pre-delete record.
                hit.prior = hit.record.take();
                return Ok(hit);
            }
        }

        let prior = get_complaint_tx(&tx, id)?.ok_or(SyncError::NotFound(id))?;
        let now = OffsetDateTime::now_utc();

        tx.execute("DELETE FROM complaints WHERE id = ?1", params![id.to_string()])
            .map_err(storage("failed to delete complaint"))?;

        if let Some(local_id) = local_id {
            record_applied(&tx, local_id, actor, &digest, Some(&prior), now)?;
        }

        tx.commit().map_err(commit_err)?;

        Ok(Committed {
            record: None,
            prior: Some(prior),
            change: Some(ChangeEvent { record_id: id, kind: ChangeKind::Deleted, snapshot: None }),
            notifications: Vec::new(),
            already_applied: false,
        })
    }

    /// # Errors
    /// Returns `Storage` when the row cannot be read or decoded.
    pub fn get(&self, id: ComplaintId) -> Result<Option<Complaint>, SyncError> {
        get_complaint_conn(&self.conn, id)
    }

    /// List complaints newest-first (year, then sequence descending).
    ///
    /// # Errors
    /// Returns `Storage` when rows cannot be read or decoded.
    pub fn list(&self) -> Result<Vec<Complaint>, SyncError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, year_key, sequence_number, summary, status, priority,
                        owner_id, created_at, updated_at, version
                 FROM complaints
                 ORDER BY year_key DESC, sequence_number DESC",
            )
            .map_err(storage("failed to prepare complaint listing"))?;

        let mut rows = stmt.query([]).map_err(storage("failed to query complaints"))?;
        let mut complaints = Vec::new();
        while let Some(row) = rows.next().map_err(storage("failed to read complaint row"))? {
            complaints.push(complaint_from_row(row)?);
        }
        Ok(complaints)
    }

    /// Per-status complaint counts in one aggregate query.
    ///
    /// # Errors
    /// Returns `Storage` when the aggregate cannot be read.
    pub fn stats(&self) -> Result<ComplaintStats, SyncError> {
        self.conn
            .query_row(
                "SELECT
                    COUNT(*),
                    COUNT(CASE WHEN status = 'new' THEN 1 END),
                    COUNT(CASE WHEN status = 'in-progress' THEN 1 END),
                    COUNT(CASE WHEN status = 'resolved' THEN 1 END),
                    COUNT(CASE WHEN status = 'closed' THEN 1 END)
                 FROM complaints",
                [],
                |row| {
                    Ok(ComplaintStats {
                        total: row.get(0)?,
                        new: row.get(1)?,
                        in_progress: row.get(2)?,
                        resolved: row.get(3)?,
                        closed: row.get(4)?,
                    })
                },
            )
            .map_err(storage("failed to compute complaint stats"))
    }

    /// Register (or re-register) an actor in the roster. Identity is
    /// verified upstream; the store only needs the role for fan-out.
    ///
    /// # Errors
    /// Returns `Storage` when the upsert fails.
    pub fn register_actor(&mut self, actor: Actor) -> Result<(), SyncError> {
        self.conn
            .execute(
                "INSERT INTO actors(id, role) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET role = excluded.role",
                params![actor.id.to_string(), actor.role.as_str()],
            )
            .map_err(storage("failed to register actor"))?;
        Ok(())
    }

    /// # Errors
    /// Returns `Storage` when the roster cannot be read.
    pub fn staff_recipients(&self) -> Result<Vec<ActorId>, SyncError> {
        staff_recipients_conn(&self.conn)
    }

    /// Persisted notifications for one recipient, newest-first.
    ///
    /// # Errors
    /// Returns `Storage` when rows cannot be read or decoded.
    pub fn notifications_for(
        &self,
        recipient_id: ActorId,
        unread_only: bool,
    ) -> Result<Vec<NotificationEvent>, SyncError> {
        let sql = if unread_only {
            "SELECT id, recipient_id, record_id, title, message, category, created_at, is_read
             FROM notifications WHERE recipient_id = ?1 AND is_read = 0
             ORDER BY created_at DESC, id DESC"
        } else {
            "SELECT id, recipient_id, record_id, title, message, category, created_at, is_read
             FROM notifications WHERE recipient_id = ?1
             ORDER BY created_at DESC, id DESC"
        };

        let mut stmt =
            self.conn.prepare(sql).map_err(storage("failed to prepare notification listing"))?;
        let mut rows = stmt
            .query(params![recipient_id.to_string()])
            .map_err(storage("failed to query notifications"))?;

        let mut notifications = Vec::new();
        while let Some(row) = rows.next().map_err(storage("failed to read notification row"))? {
            notifications.push(notification_from_row(row)?);
        }
        Ok(notifications)
    }

    /// Acknowledge one notification. Returns false when the id is unknown.
    ///
    /// # Errors
    /// Returns `Storage` when the write fails.
    pub fn mark_notification_read(&mut self, id: NotificationId) -> Result<bool, SyncError> {
        let affected = self
            .conn
            .execute("UPDATE notifications SET is_read = 1 WHERE id = ?1", params![id.to_string()])
            .map_err(storage("failed to mark notification read"))?;
        Ok(affected > 0)
    }

    /// Acknowledge every notification for one recipient; returns the count.
    ///
    /// # Errors
    /// Returns `Storage` when the write fails.
    pub fn mark_all_notifications_read(&mut self, recipient_id: ActorId) -> Result<u64, SyncError> {
        let affected = self
            .conn
            .execute(
                "UPDATE notifications SET is_read = 1 WHERE recipient_id = ?1 AND is_read = 0",
                params![recipient_id.to_string()],
            )
            .map_err(storage("failed to mark notifications read"))?;
        Ok(affected as u64)
    }

    fn begin_immediate(&mut self) -> Result<Transaction<'_>, SyncError> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| {
                if is_busy(&err) {
                    SyncError::AllocationContention
                } else {
                    SyncError::Storage(format!("failed to start transaction: {err}"))
                }
            })
    }
}

/// Reserve the next sequence number for `year_key`. The counter row is
/// created on first use; the increment and read happen in one statement
/// inside the caller's transaction, so the reservation is released only by
/// commit or rollback.
fn allocate_sequence(tx: &Transaction<'_>, year_key: &str) -> Result<i64, SyncError> {
    tx.query_row(
        "INSERT INTO year_sequences(year_key, last_value) VALUES (?1, 1)
         ON CONFLICT(year_key) DO UPDATE SET last_value = last_value + 1
         RETURNING last_value",
        params![year_key],
        |row| row.get(0),
    )
    .map_err(storage("failed to allocate sequence number"))
}

fn replay_hit(
    tx: &Transaction<'_>,
    local_id: LocalId,
    digest: &str,
) -> Result<Option<Committed>, SyncError> {
    let row = tx
        .query_row(
            "SELECT payload_digest, record_json FROM applied_mutations WHERE local_id = ?1",
            params![local_id.to_string()],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
        )
        .optional()
        .map_err(storage("failed to look up applied mutation"))?;

    let Some((stored_digest, record_json)) = row else {
        return Ok(None);
    };
    if stored_digest != digest {
        return Err(SyncError::ReplayMismatch { local_id });
    }

    let record = match record_json {
        Some(json) => Some(
            serde_json::from_str(&json)
                .map_err(|err| SyncError::Storage(format!("failed to decode applied mutation record: {err}")))?,
        ),
        None => None,
    };

    Ok(Some(Committed {
        record,
        prior: None,
        change: None,
        notifications: Vec::new(),
        already_applied: true,
    }))
}

fn record_applied(
    tx: &Transaction<'_>,
    local_id: LocalId,
    actor: Actor,
    digest: &str,
    record: Option<&Complaint>,
    now: OffsetDateTime,
) -> Result<(), SyncError> {
    let record_json = match record {
        Some(record) => Some(
            serde_json::to_string(record)
                .map_err(|err| SyncError::Storage(format!("failed to encode applied record: {err}")))?,
        ),
        None => None,
    };

    tx.execute(
        "INSERT INTO applied_mutations(local_id, actor_id, payload_digest, record_json, applied_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![local_id.to_string(), actor.id.to_string(), digest, record_json, rfc3339(now)?],
    )
    .map_err(storage("failed to record applied mutation"))?;
    Ok(())
}

fn insert_notifications(
    tx: &Transaction<'_>,
    drafts: Vec<NotificationDraft>,
    now: OffsetDateTime,
) -> Result<Vec<NotificationEvent>, SyncError> {
    let mut events = Vec::with_capacity(drafts.len());
    for draft in drafts {
        let event = NotificationEvent {
            id: NotificationId::new(),
            recipient_id: draft.recipient_id,
            record_id: draft.record_id,
            title: draft.title,
            message: draft.message,
            category: draft.category,
            created_at: now,
            read: false,
        };
        tx.execute(
            "INSERT INTO notifications(
                id, recipient_id, record_id, title, message, category, created_at, is_read
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
            params![
                event.id.to_string(),
                event.recipient_id.to_string(),
                event.record_id.to_string(),
                event.title,
                event.message,
                event.category.as_str(),
                rfc3339(event.created_at)?,
            ],
        )
        .map_err(storage("failed to insert notification"))?;
        events.push(event);
    }
    Ok(events)
}

fn get_complaint_tx(tx: &Transaction<'_>, id: ComplaintId) -> Result<Option<Complaint>, SyncError> {
    get_complaint_conn(tx, id)
}

fn get_complaint_conn(
    conn: &Connection,
    id: ComplaintId,
) -> Result<Option<Complaint>, SyncError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, year_key, sequence_number, summary, status, priority,
                    owner_id, created_at, updated_at, version
             FROM complaints WHERE id = ?1",
        )
        .map_err(storage("failed to prepare complaint lookup"))?;

    let mut rows =
        stmt.query(params![id.to_string()]).map_err(storage("failed to query complaint"))?;
    match rows.next().map_err(storage("failed to read complaint row"))? {
        Some(row) => Ok(Some(complaint_from_row(row)?)),
        None => Ok(None),
    }
}

fn staff_recipients_tx(tx: &Transaction<'_>) -> Result<Vec<ActorId>, SyncError> {
    staff_recipients_conn(tx)
}

fn staff_recipients_conn(conn: &Connection) -> Result<Vec<ActorId>, SyncError> {
    let mut stmt = conn
        .prepare("SELECT id FROM actors WHERE role = 'staff' ORDER BY id ASC")
        .map_err(storage("failed to prepare staff roster query"))?;
    let mut rows = stmt.query([]).map_err(storage("failed to query staff roster"))?;

    let mut staff = Vec::new();
    while let Some(row) = rows.next().map_err(storage("failed to read roster row"))? {
        let raw: String = row.get(0).map_err(storage("failed to read roster id"))?;
        staff.push(ActorId(parse_ulid(&raw)?));
    }
    Ok(staff)
}

fn complaint_from_row(row: &rusqlite::Row<'_>) -> Result<Complaint, SyncError> {
    let id_raw: String = row.get(0).map_err(storage("failed to read complaint id"))?;
    let status_raw: String = row.get(4).map_err(storage("failed to read status"))?;
    let priority_raw: String = row.get(5).map_err(storage("failed to read priority"))?;
    let owner_raw: Option<String> = row.get(6).map_err(storage("failed to read owner"))?;
    let created_raw: String = row.get(7).map_err(storage("failed to read created_at"))?;
    let updated_raw: String = row.get(8).map_err(storage("failed to read updated_at"))?;

    Ok(Complaint {
        id: ComplaintId(parse_ulid(&id_raw)?),
        year_key: row.get(1).map_err(storage("failed to read year_key"))?,
        sequence_number: row.get(2).map_err(storage("failed to read sequence_number"))?,
        summary: row.get(3).map_err(storage("failed to read summary"))?,
        status: ComplaintStatus::parse(&status_raw)
            .ok_or_else(|| SyncError::Storage(format!("unknown status: {status_raw}")))?,
        priority: Priority::parse(&priority_raw)
            .ok_or_else(|| SyncError::Storage(format!("unknown priority: {priority_raw}")))?,
        owner_id: match owner_raw {
            Some(raw) => Some(ActorId(parse_ulid(&raw)?)),
            None => None,
        },
        created_at: parse_rfc3339(&created_raw)?,
        updated_at: parse_rfc3339(&updated_raw)?,
        version: row.get(9).map_err(storage("failed to read version"))?,
    })
}

fn notification_from_row(row: &rusqlite::Row<'_>) -> Result<NotificationEvent, SyncError> {
    let id_raw: String = row.get(0).map_err(storage("failed to read notification id"))?;
    let recipient_raw: String = row.get(1).map_err(storage("failed to read recipient"))?;
    let record_raw: String = row.get(2).map_err(storage("failed to read record id"))?;
    let category_raw: String = row.get(5).map_err(storage("failed to read category"))?;
    let created_raw: String = row.get(6).map_err(storage("failed to read created_at"))?;
    let is_read: i64 = row.get(7).map_err(storage("failed to read is_read"))?;

    Ok(NotificationEvent {
        id: NotificationId(parse_ulid(&id_raw)?),
        recipient_id: ActorId(parse_ulid(&recipient_raw)?),
        record_id: ComplaintId(parse_ulid(&record_raw)?),
        title: row.get(3).map_err(storage("failed to read title"))?,
        message: row.get(4).map_err(storage("failed to read message"))?,
        category: caseflow_core::NotificationCategory::parse(&category_raw)
            .ok_or_else(|| SyncError::Storage(format!("unknown category: {category_raw}")))?,
        created_at: parse_rfc3339(&created_raw)?,
        read: is_read != 0,
    })
}

fn create_digest(input: &CreateComplaint, actor: Actor) -> Result<String, SyncError> {
    let payload = serde_json::to_string(input)
        .map_err(|err| SyncError::Storage(format!("failed to encode create payload: {err}")))?;
    Ok(digest_parts(&["create", &payload, &actor.id.to_string()]))
}

fn update_digest(
    id: ComplaintId,
    patch: &ComplaintPatch,
    expected_version: Option<i64>,
    actor: Actor,
) -> Result<String, SyncError> {
    let payload = serde_json::to_string(patch)
        .map_err(|err| SyncError::Storage(format!("failed to encode update payload: {err}")))?;
    let expected = expected_version.map_or_else(String::new, |v| v.to_string());
    Ok(digest_parts(&["update", &id.to_string(), &payload, &expected, &actor.id.to_string()]))
}

fn delete_digest(id: ComplaintId, actor: Actor) -> Result<String, SyncError> {
    Ok(digest_parts(&["delete", &id.to_string(), &actor.id.to_string()]))
}

fn digest_parts(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    format!("{digest:x}")
}

fn current_schema_version(conn: &Connection) -> Result<i64, SyncError> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| row.get(0))
        .map_err(storage("failed to read schema version"))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<(), SyncError> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, rfc3339(OffsetDateTime::now_utc())?],
    )
    .map_err(storage("failed to record schema version"))?;
    Ok(())
}

fn parse_ulid(raw: &str) -> Result<Ulid, SyncError> {
    Ulid::from_string(raw).map_err(|err| SyncError::Storage(format!("invalid ulid {raw}: {err}")))
}

fn rfc3339(ts: OffsetDateTime) -> Result<String, SyncError> {
    ts.format(&Rfc3339)
        .map_err(|err| SyncError::Storage(format!("failed to format timestamp: {err}")))
}

fn parse_rfc3339(raw: &str) -> Result<OffsetDateTime, SyncError> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .map_err(|err| SyncError::Storage(format!("invalid timestamp {raw}: {err}")))
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == rusqlite::ErrorCode::DatabaseBusy
                || code.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

fn commit_err(err: rusqlite::Error) -> SyncError {
    if is_busy(&err) {
        SyncError::AllocationContention
    } else {
        SyncError::Storage(format!("failed to commit transaction: {err}"))
    }
}

fn storage(context: &'static str) -> impl FnOnce(rusqlite::Error) -> SyncError {
    move |err| SyncError::Storage(format!("{context}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use time::macros::date;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("caseflow-store-{}.sqlite3", Ulid::new()))
    }

    fn open_store(path: &Path) -> Result<SqliteChangeStore, SyncError> {
        let mut store = SqliteChangeStore::open(path)?;
        store.migrate()?;
        Ok(store)
    }

    fn create_input(summary: &str) -> CreateComplaint {
        CreateComplaint {
            summary: summary.to_string(),
            priority: Priority::Medium,
            business_date: date!(2025 - 02 - 11),
        }
    }

    fn staff_actor() -> Actor {
        Actor { id: ActorId::new(), role: Role::Staff }
    }

    fn field_actor() -> Actor {
        Actor { id: ActorId::new(), role: Role::Field }
    }

    // Test IDs: TSTORE-001
    #[test]
    fn sequence_numbers_are_dense_and_ordered_within_a_year() -> Result<(), SyncError> {
        let path = unique_temp_db_path();
        let mut store = open_store(&path)?;
        let actor = staff_actor();

        let first = store.create(&create_input("first"), actor, None)?;
        let second = store.create(&create_input("second"), actor, None)?;
        let third = store.create(&create_input("third"), actor, None)?;

        let seqs: Vec<i64> = [first, second, third]
            .iter()
            .filter_map(|c| c.record.as_ref().map(|r| r.sequence_number))
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    // Test IDs: TSTORE-002
    #[test]
    fn sequence_counters_are_scoped_per_year_key() -> Result<(), SyncError> {
        let path = unique_temp_db_path();
        let mut store = open_store(&path)?;
        let actor = staff_actor();

        let a = store.create(&create_input("this year"), actor, None)?;
        let mut other_year = create_input("last year");
        other_year.business_date = date!(2024 - 12 - 30);
        let b = store.create(&other_year, actor, None)?;

        let a = a.record.ok_or(SyncError::Validation("missing record".to_string()))?;
        let b = b.record.ok_or(SyncError::Validation("missing record".to_string()))?;
        assert_eq!(a.year_key, "2025");
        assert_eq!(b.year_key, "2024");
        assert_eq!(a.sequence_number, 1);
        assert_eq!(b.sequence_number, 1);

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    // Test IDs: TSTORE-003
    #[test]
    fn field_creation_persists_staff_notifications_in_the_same_commit() -> Result<(), SyncError> {
        let path = unique_temp_db_path();
        let mut store = open_store(&path)?;
        let staff = staff_actor();
        let field = field_actor();
        store.register_actor(staff)?;
        store.register_actor(field)?;

        let committed = store.create(&create_input("damaged packaging"), field, None)?;

        assert_eq!(committed.notifications.len(), 1);
        assert_eq!(committed.notifications[0].recipient_id, staff.id);

        let persisted = store.notifications_for(staff.id, true)?;
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].category, caseflow_core::NotificationCategory::NewRecord);
        assert!(!persisted[0].read);

        // The creator got nothing.
        assert!(store.notifications_for(field.id, false)?.is_empty());

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    // Test IDs: TSTORE-004
    #[test]
    fn staff_creation_is_silent_and_unowned() -> Result<(), SyncError> {
        let path = unique_temp_db_path();
        let mut store = open_store(&path)?;
        let staff = staff_actor();
        let other_staff = staff_actor();
        store.register_actor(staff)?;
        store.register_actor(other_staff)?;

        let committed = store.create(&create_input("rate variation"), staff, None)?;

        assert!(committed.notifications.is_empty());
        let record = committed.record.ok_or(SyncError::Validation("missing record".to_string()))?;
        assert_eq!(record.owner_id, None);
        assert!(store.notifications_for(other_staff.id, false)?.is_empty());

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    // Test IDs: TSTORE-005
    #[test]
    fn stale_expected_version_conflicts_with_current_version_reported() -> Result<(), SyncError> {
        let path = unique_temp_db_path();
        let mut store = open_store(&path)?;
        let staff = staff_actor();

        let created = store.create(&create_input("mrp issue"), staff, None)?;
        let record = created.record.ok_or(SyncError::Validation("missing record".to_string()))?;

        let patch = ComplaintPatch { priority: Some(Priority::High), ..ComplaintPatch::default() };
        let first = store.update(record.id, &patch, staff, Some(1), None)?;
        let updated = first.record.ok_or(SyncError::Validation("missing record".to_string()))?;
        assert_eq!(updated.version, 2);

        // Second writer still believes version 1.
        let second = store.update(record.id, &patch, staff, Some(1), None);
        assert_eq!(
            second,
            Err(SyncError::Conflict { record_id: record.id, expected: 1, current: 2 })
        );

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    // Test IDs: TSTORE-006
    #[test]
    fn staff_status_change_notifies_owner_inside_the_transaction() -> Result<(), SyncError> {
        let path = unique_temp_db_path();
        let mut store = open_store(&path)?;
        let staff = staff_actor();
        let field = field_actor();
        store.register_actor(staff)?;
        store.register_actor(field)?;

        let created = store.create(&create_input("stock theft"), field, None)?;
        let record = created.record.ok_or(SyncError::Validation("missing record".to_string()))?;

        let patch = ComplaintPatch {
            status: Some(ComplaintStatus::InProgress),
            ..ComplaintPatch::default()
        };
        let committed = store.update(record.id, &patch, staff, None, None)?;

        assert_eq!(committed.notifications.len(), 1);
        assert_eq!(committed.notifications[0].recipient_id, field.id);
        assert_eq!(
            committed.notifications[0].category,
            caseflow_core::NotificationCategory::StatusUpdate
        );

        let unread = store.notifications_for(field.id, true)?;
        assert_eq!(unread.len(), 1);

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    // Test IDs: TSTORE-007
    #[test]
    fn replayed_create_is_a_no_op_returning_the_prior_result() -> Result<(), SyncError> {
        let path = unique_temp_db_path();
        let mut store = open_store(&path)?;
        let staff = staff_actor();
        let field = field_actor();
        store.register_actor(staff)?;
        store.register_actor(field)?;

        let local_id = LocalId::new();
        let input = create_input("short delivery");

        let first = store.create(&input, field, Some(local_id))?;
        let second = store.create(&input, field, Some(local_id))?;

        let first_record =
            first.record.ok_or(SyncError::Validation("missing record".to_string()))?;
        let second_record =
            second.record.ok_or(SyncError::Validation("missing record".to_string()))?;

        assert!(!first.already_applied);
        assert!(second.already_applied);
        assert!(second.change.is_none());
        assert_eq!(first_record, second_record);

        // Exactly one record and one notification across both submissions.
        assert_eq!(store.list()?.len(), 1);
        assert_eq!(store.notifications_for(staff.id, false)?.len(), 1);

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    // Test IDs: TSTORE-008
    #[test]
    fn replay_with_a_different_payload_is_rejected() -> Result<(), SyncError> {
        let path = unique_temp_db_path();
        let mut store = open_store(&path)?;
        let field = field_actor();

        let local_id = LocalId::new();
        store.create(&create_input("original wording"), field, Some(local_id))?;
        let diverged = store.create(&create_input("tampered wording"), field, Some(local_id));

        assert_eq!(diverged, Err(SyncError::ReplayMismatch { local_id }));
        assert_eq!(store.list()?.len(), 1);

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    // Test IDs: TSTORE-009
    #[test]
    fn delete_emits_a_deleted_change_and_is_silent() -> Result<(), SyncError> {
        let path = unique_temp_db_path();
        let mut store = open_store(&path)?;
        let staff = staff_actor();
        let field = field_actor();
        store.register_actor(staff)?;
        store.register_actor(field)?;

        let created = store.create(&create_input("duplicate entry"), field, None)?;
        let record = created.record.ok_or(SyncError::Validation("missing record".to_string()))?;
        let before = store.notifications_for(staff.id, false)?.len();

        let local_id = LocalId::new();
        let committed = store.delete(record.id, staff, Some(local_id))?;

        assert_eq!(
            committed.change,
            Some(ChangeEvent { record_id: record.id, kind: ChangeKind::Deleted, snapshot: None })
        );
        assert!(committed.notifications.is_empty());
        assert_eq!(store.notifications_for(staff.id, false)?.len(), before);
        assert_eq!(store.get(record.id)?, None);

        // Replaying the delete after the row is gone stays a no-op.
        let replayed = store.delete(record.id, staff, Some(local_id))?;
        assert!(replayed.already_applied);
        assert!(replayed.change.is_none());

        // A fresh delete of the missing record is terminal.
        assert_eq!(store.delete(record.id, staff, None), Err(SyncError::NotFound(record.id)));

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    // Test IDs: TSTORE-010
    #[test]
    fn notification_acknowledgement_flows() -> Result<(), SyncError> {
        let path = unique_temp_db_path();
        let mut store = open_store(&path)?;
        let staff = staff_actor();
        let field = field_actor();
        store.register_actor(staff)?;
        store.register_actor(field)?;

        store.create(&create_input("one"), field, None)?;
        store.create(&create_input("two"), field, None)?;

        let unread = store.notifications_for(staff.id, true)?;
        assert_eq!(unread.len(), 2);

        assert!(store.mark_notification_read(unread[0].id)?);
        assert_eq!(store.notifications_for(staff.id, true)?.len(), 1);
        assert!(!store.mark_notification_read(NotificationId::new())?);

        assert_eq!(store.mark_all_notifications_read(staff.id)?, 1);
        assert!(store.notifications_for(staff.id, true)?.is_empty());
        assert_eq!(store.notifications_for(staff.id, false)?.len(), 2);

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    // Test IDs: TSTORE-011
    #[test]
    fn stats_count_per_status() -> Result<(), SyncError> {
        let path = unique_temp_db_path();
        let mut store = open_store(&path)?;
        let staff = staff_actor();

        let a = store.create(&create_input("a"), staff, None)?;
        store.create(&create_input("b"), staff, None)?;
        let a = a.record.ok_or(SyncError::Validation("missing record".to_string()))?;

        let patch = ComplaintPatch {
            status: Some(ComplaintStatus::Resolved),
            ..ComplaintPatch::default()
        };
        store.update(a.id, &patch, staff, None, None)?;

        let stats = store.stats()?;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.new, 1);
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.in_progress, 0);
        assert_eq!(stats.closed, 0);

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    // Test IDs: TSTORE-012
    #[test]
    fn empty_patch_and_missing_record_are_rejected() -> Result<(), SyncError> {
        let path = unique_temp_db_path();
        let mut store = open_store(&path)?;
        let staff = staff_actor();

        let empty = store.update(ComplaintId::new(), &ComplaintPatch::default(), staff, None, None);
        assert!(matches!(empty, Err(SyncError::Validation(_))));

        let missing = ComplaintId::new();
        let patch = ComplaintPatch { priority: Some(Priority::Low), ..ComplaintPatch::default() };
        assert_eq!(
            store.update(missing, &patch, staff, None, None),
            Err(SyncError::NotFound(missing))
        );

        let _ = std::fs::remove_file(&path);
        Ok(())
    }
}

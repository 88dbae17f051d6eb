//! Client-side synchronization agent.
//!
//! Holds the local mirror of complaint records, an offline queue of
//! mutations awaiting server confirmation, and the reconnect state machine.
//! Mutations apply to the local mirror immediately and are confirmed or
//! discarded when the queue is reconciled against a [`MutationTransport`].

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use caseflow_core::{
    Actor, ChangeEvent, ChangeKind, Complaint, ComplaintId, ComplaintPatch, ComplaintStatus,
    CreateComplaint, Frame, LocalId, NotificationEvent, Role, SyncError,
};

/// Where the agent sits in the connection lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Disconnected,
    Connecting,
    /// Subscribed and caught up; mutations are submitted as they are staged.
    Live,
    /// Subscribed but draining the offline queue or refetching after a gap.
    Reconciling,
}

/// One staged mutation, identified by its client-generated [`LocalId`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum Operation {
    Create { input: CreateComplaint, actor: Actor },
    Update { id: ComplaintId, patch: ComplaintPatch, expected_version: Option<i64> },
    Delete { id: ComplaintId },
}

impl Operation {
    /// Record the operation targets, if it targets an existing record.
    #[must_use]
    pub fn target(&self) -> Option<ComplaintId> {
        match self {
            Self::Create { .. } => None,
            Self::Update { id, .. } | Self::Delete { id } => Some(*id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedMutation {
    pub local_id: LocalId,
    pub operation: Operation,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(skip)]
    in_flight: bool,
}

/// Server confirmation for one submitted mutation.
///
/// `record` is the authoritative post-write snapshot, `None` for deletions.
/// `already_applied` marks an idempotent replay hit: the server had seen the
/// local id before and returned the original result instead of reapplying.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitAck {
    pub record: Option<Complaint>,
    pub already_applied: bool,
}

/// Delivery seam between the agent and the server.
///
/// Implementations map [`QueuedMutation`] onto the wire. Returning
/// `SyncError::TransportUnavailable` (or `AllocationContention`) keeps the
/// mutation queued for the next reconciliation pass; any other error is
/// terminal for that mutation and discards it with a warning.
pub trait MutationTransport {
    /// Submit one mutation and wait for the server's confirmation.
    ///
    /// # Errors
    /// Returns the server-side or transport failure for this submission.
    fn submit(&mut self, mutation: &QueuedMutation) -> Result<SubmitAck, SyncError>;
}

/// Surfaced to the user when a queued mutation is dropped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncWarning {
    pub local_id: LocalId,
    pub record_id: Option<ComplaintId>,
    pub reason: String,
}

/// Exponential reconnect backoff: `min(base * 2^attempt, cap)`, giving up
/// after `max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { base: Duration::from_secs(1), cap: Duration::from_secs(30), max_attempts: 5 }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt `attempt` (zero-based), or `None` once
    /// the attempt budget is exhausted.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
        Some((self.base.saturating_mul(factor)).min(self.cap))
    }
}

#[derive(Debug)]
pub struct ClientSyncAgent {
    state: SyncState,
    records: BTreeMap<ComplaintId, Complaint>,
    queue: VecDeque<QueuedMutation>,
    /// Provisional record ids handed out for optimistic creates, keyed by the
    /// mutation that will replace them.
    placeholders: BTreeMap<LocalId, ComplaintId>,
    notifications: Vec<NotificationEvent>,
    warnings: Vec<SyncWarning>,
    backoff: BackoffPolicy,
    reconnect_attempts: u32,
    sync_failed: bool,
    gap_detected: bool,
}

impl Default for ClientSyncAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientSyncAgent {
    #[must_use]
    pub fn new() -> Self {
        Self::with_backoff(BackoffPolicy::default())
    }

    #[must_use]
    pub fn with_backoff(backoff: BackoffPolicy) -> Self {
        Self {
            state: SyncState::Disconnected,
            records: BTreeMap::new(),
            queue: VecDeque::new(),
            placeholders: BTreeMap::new(),
            notifications: Vec::new(),
            warnings: Vec::new(),
            backoff,
            reconnect_attempts: 0,
            sync_failed: false,
            gap_detected: false,
        }
    }

    #[must_use]
    pub fn state(&self) -> SyncState {
        self.state
    }

    #[must_use]
    pub fn record(&self, id: ComplaintId) -> Option<&Complaint> {
        self.records.get(&id)
    }

    pub fn records(&self) -> impl Iterator<Item = &Complaint> {
        self.records.values()
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn warnings(&self) -> &[SyncWarning] {
        &self.warnings
    }

    pub fn take_warnings(&mut self) -> Vec<SyncWarning> {
        std::mem::take(&mut self.warnings)
    }

    #[must_use]
    pub fn notifications(&self) -> &[NotificationEvent] {
        &self.notifications
    }

    /// Provisional id assigned to a staged create, until the server echo
    /// replaces it with the authoritative record.
    #[must_use]
    pub fn provisional_id(&self, local_id: LocalId) -> Option<ComplaintId> {
        self.placeholders.get(&local_id).copied()
    }

    /// True once the reconnect attempt budget has been exhausted. Cleared by
    /// the next successful handshake.
    #[must_use]
    pub fn sync_failed(&self) -> bool {
        self.sync_failed
    }

    /// True when a version gap was observed on the event stream and the
    /// local mirror needs a full refetch. Cleared by [`Self::seed`].
    #[must_use]
    pub fn gap_detected(&self) -> bool {
        self.gap_detected
    }

    /// Replace the local mirror with an authoritative snapshot, then re-apply
    /// the optimistic effect of every still-queued mutation in order.
    pub fn seed(&mut self, records: Vec<Complaint>) {
        self.records = records.into_iter().map(|record| (record.id, record)).collect();
        self.gap_detected = false;
        let staged: Vec<(LocalId, Operation)> = self
            .queue
            .iter()
            .map(|mutation| (mutation.local_id, mutation.operation.clone()))
            .collect();
        for (local_id, operation) in staged {
            self.apply_optimistic(local_id, &operation);
        }
    }

    /// Stage a creation: the record appears immediately under a provisional
    /// id with `sequence_number` 0 until the server assigns the real one.
    ///
    /// # Errors
    /// Returns `SyncError::Validation` when the input is invalid.
    pub fn stage_create(
        &mut self,
        input: CreateComplaint,
        actor: Actor,
    ) -> Result<LocalId, SyncError> {
        input.validate()?;
        Ok(self.stage(Operation::Create { input, actor }))
    }

    /// Stage a field update against the local copy.
    ///
    /// # Errors
    /// Returns `SyncError::Validation` when the patch is empty.
    pub fn stage_update(
        &mut self,
        id: ComplaintId,
        patch: ComplaintPatch,
        expected_version: Option<i64>,
    ) -> Result<LocalId, SyncError> {
        if patch.is_empty() {
            return Err(SyncError::Validation("patch must change at least one field".to_string()));
        }
        Ok(self.stage(Operation::Update { id, patch, expected_version }))
    }

    pub fn stage_delete(&mut self, id: ComplaintId) -> LocalId {
        self.stage(Operation::Delete { id })
    }

    fn stage(&mut self, operation: Operation) -> LocalId {
        let local_id = LocalId::new();
        self.apply_optimistic(local_id, &operation);
        self.queue.push_back(QueuedMutation {
            local_id,
            operation,
            created_at: OffsetDateTime::now_utc(),
            in_flight: false,
        });
        local_id
    }

    /// Remove a staged mutation before it is submitted. Returns `false` when
    /// the mutation is unknown or already in flight. Cancelling a create also
    /// retracts its provisional record.
    pub fn cancel(&mut self, local_id: LocalId) -> bool {
        let Some(position) = self
            .queue
            .iter()
            .position(|mutation| mutation.local_id == local_id && !mutation.in_flight)
        else {
            return false;
        };
        if self.queue.remove(position).is_some() {
            if let Some(provisional) = self.placeholders.remove(&local_id) {
                self.records.remove(&provisional);
            }
            return true;
        }
        false
    }

    pub fn connection_lost(&mut self) {
        self.state = SyncState::Disconnected;
    }

    /// Begin (or continue) the reconnect ladder. Returns the delay to wait
    /// before the next subscribe attempt, or `None` once the budget is spent,
    /// at which point [`Self::sync_failed`] turns on.
    pub fn next_reconnect_delay(&mut self) -> Option<Duration> {
        match self.backoff.delay(self.reconnect_attempts) {
            Some(delay) => {
                self.reconnect_attempts += 1;
                self.state = SyncState::Connecting;
                Some(delay)
            }
            None => {
                self.sync_failed = true;
                None
            }
        }
    }

    /// Called once the subscribe handshake succeeds. Resets the backoff
    /// ladder and moves to `Reconciling` so queued mutations replay first.
    pub fn handshake_complete(&mut self) {
        self.reconnect_attempts = 0;
        self.sync_failed = false;
        self.state = SyncState::Reconciling;
    }

    /// Drain the offline queue head-first over `transport`. Stops on the
    /// first transport outage, leaving the failed mutation queued; discards
    /// mutations the server rejects terminally. Returns the number of
    /// mutations confirmed this pass.
    ///
    /// While `Live`, call this right after staging so mutations are
    /// submitted immediately; after a reconnect handshake it replays the
    /// whole queue in order.
    pub fn reconcile<T: MutationTransport>(&mut self, transport: &mut T) -> usize {
        self.state = SyncState::Reconciling;
        let mut confirmed = 0;
        while let Some(front) = self.queue.front_mut() {
            front.in_flight = true;
            let outcome = transport.submit(front);
            match outcome {
                Ok(ack) => {
                    if let Some(mutation) = self.queue.pop_front() {
                        self.absorb_ack(&mutation, ack);
                        confirmed += 1;
                    }
                }
                Err(SyncError::TransportUnavailable(_) | SyncError::AllocationContention) => {
                    if let Some(front) = self.queue.front_mut() {
                        front.in_flight = false;
                    }
                    self.state = SyncState::Disconnected;
                    return confirmed;
                }
                Err(err) => {
                    if let Some(mutation) = self.queue.pop_front() {
                        self.discard(&mutation, &err);
                    }
                }
            }
        }
        self.state = SyncState::Live;
        confirmed
    }

    /// Fold one broadcast frame into local state.
    pub fn observe_frame(&mut self, frame: &Frame) {
        match frame {
            Frame::RecordChanged { change, .. } => self.observe_change(change),
            Frame::Notification(event) => self.notifications.push(event.clone()),
        }
    }

    /// Fold one authoritative change event into the local mirror. A skipped
    /// version (or an update to a record never seen) marks a gap and drops
    /// the agent back to `Reconciling`.
    pub fn observe_change(&mut self, change: &ChangeEvent) {
        if change.kind == ChangeKind::Deleted {
            self.records.remove(&change.record_id);
            return;
        }
        let Some(snapshot) = &change.snapshot else {
            return;
        };
        let gap = match self.records.get(&snapshot.id) {
            Some(local) => snapshot.version > local.version + 1,
            None => change.kind == ChangeKind::Updated,
        };
        self.records.insert(snapshot.id, snapshot.clone());
        if gap {
            self.gap_detected = true;
            if self.state == SyncState::Live {
                self.state = SyncState::Reconciling;
            }
        }
    }

    fn apply_optimistic(&mut self, local_id: LocalId, operation: &Operation) {
        match operation {
            Operation::Create { input, actor } => {
                let provisional =
                    *self.placeholders.entry(local_id).or_insert_with(ComplaintId::new);
                let now = OffsetDateTime::now_utc();
                self.records.insert(
                    provisional,
                    Complaint {
                        id: provisional,
                        year_key: input.year_key(),
                        // Sequence 0 marks "not yet assigned by the server".
                        sequence_number: 0,
                        summary: input.summary.clone(),
                        status: ComplaintStatus::New,
                        priority: input.priority,
                        owner_id: (actor.role == Role::Field).then_some(actor.id),
                        created_at: now,
                        updated_at: now,
                        version: 0,
                    },
                );
            }
            Operation::Update { id, patch, .. } => {
                if let Some(record) = self.records.get_mut(id) {
                    if let Some(summary) = &patch.summary {
                        record.summary = summary.clone();
                    }
                    if let Some(status) = patch.status {
                        record.status = status;
                    }
                    if let Some(priority) = patch.priority {
                        record.priority = priority;
                    }
                    record.updated_at = OffsetDateTime::now_utc();
                }
            }
            Operation::Delete { id } => {
                self.records.remove(id);
            }
        }
    }

    fn absorb_ack(&mut self, mutation: &QueuedMutation, ack: SubmitAck) {
        if matches!(mutation.operation, Operation::Create { .. }) {
            if let Some(provisional) = self.placeholders.remove(&mutation.local_id) {
                self.records.remove(&provisional);
            }
        }
        match ack.record {
            Some(record) => {
                self.records.insert(record.id, record);
            }
            None => {
                if let Operation::Delete { id } = mutation.operation {
                    self.records.remove(&id);
                }
            }
        }
    }

    fn discard(&mut self, mutation: &QueuedMutation, err: &SyncError) {
        if matches!(mutation.operation, Operation::Create { .. }) {
            if let Some(provisional) = self.placeholders.remove(&mutation.local_id) {
                self.records.remove(&provisional);
            }
        }
        let reason = match err {
            SyncError::Conflict { expected, current, .. } => format!(
                "mutation could not be applied, record changed (expected version {expected}, current {current})"
            ),
            other => other.to_string(),
        };
        self.warnings.push(SyncWarning {
            local_id: mutation.local_id,
            record_id: mutation.operation.target(),
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caseflow_core::{ActorId, Priority};
    use time::macros::{date, datetime};

    struct ScriptedTransport {
        responses: VecDeque<Result<SubmitAck, SyncError>>,
        submitted: Vec<LocalId>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<SubmitAck, SyncError>>) -> Self {
            Self { responses: responses.into(), submitted: Vec::new() }
        }
    }

    impl MutationTransport for ScriptedTransport {
        fn submit(&mut self, mutation: &QueuedMutation) -> Result<SubmitAck, SyncError> {
            self.submitted.push(mutation.local_id);
            self.responses.pop_front().unwrap_or_else(|| {
                Err(SyncError::TransportUnavailable("script exhausted".to_string()))
            })
        }
    }

    fn seeded_complaint(version: i64) -> Complaint {
        Complaint {
            id: ComplaintId::new(),
            year_key: "2025".to_string(),
            sequence_number: 12,
            summary: "wrong items in shipment".to_string(),
            status: ComplaintStatus::New,
            priority: Priority::Medium,
            owner_id: Some(ActorId::new()),
            created_at: datetime!(2025-05-01 09:00 UTC),
            updated_at: datetime!(2025-05-01 09:00 UTC),
            version,
        }
    }

    fn ack(record: Complaint) -> Result<SubmitAck, SyncError> {
        Ok(SubmitAck { record: Some(record), already_applied: false })
    }

    fn status_patch(status: ComplaintStatus) -> ComplaintPatch {
        ComplaintPatch { summary: None, status: Some(status), priority: None }
    }

    // Test IDs: TCLIENT-001
    #[test]
    fn queued_mutations_replay_in_fifo_order() -> Result<(), SyncError> {
        let mut agent = ClientSyncAgent::new();
        let record = seeded_complaint(1);
        agent.seed(vec![record.clone()]);

        let first =
            agent.stage_update(record.id, status_patch(ComplaintStatus::InProgress), Some(1))?;
        let second = agent.stage_update(
            record.id,
            ComplaintPatch { priority: Some(Priority::High), ..ComplaintPatch::default() },
            Some(2),
        )?;

        let mut echo_one = record.clone();
        echo_one.status = ComplaintStatus::InProgress;
        echo_one.version = 2;
        let mut echo_two = echo_one.clone();
        echo_two.priority = Priority::High;
        echo_two.version = 3;
        let mut transport = ScriptedTransport::new(vec![ack(echo_one), ack(echo_two)]);

        agent.handshake_complete();
        let confirmed = agent.reconcile(&mut transport);

        assert_eq!(confirmed, 2);
        assert_eq!(transport.submitted, vec![first, second]);
        assert_eq!(agent.pending(), 0);
        assert_eq!(agent.state(), SyncState::Live);
        let local = agent.record(record.id).ok_or(SyncError::NotFound(record.id))?;
        assert_eq!(local.version, 3);
        Ok(())
    }

    // Test IDs: TCLIENT-002
    #[test]
    fn conflicted_mutation_is_discarded_with_a_warning() -> Result<(), SyncError> {
        let mut agent = ClientSyncAgent::new();
        let record = seeded_complaint(1);
        agent.seed(vec![record.clone()]);

        let lost =
            agent.stage_update(record.id, status_patch(ComplaintStatus::Resolved), Some(1))?;
        agent.stage_update(
            record.id,
            ComplaintPatch { summary: Some("updated wording".to_string()), ..Default::default() },
            None,
        )?;

        let mut echo = record.clone();
        echo.summary = "updated wording".to_string();
        echo.version = 3;
        let mut transport = ScriptedTransport::new(vec![
            Err(SyncError::Conflict { record_id: record.id, expected: 1, current: 2 }),
            ack(echo),
        ]);

        agent.handshake_complete();
        let confirmed = agent.reconcile(&mut transport);

        assert_eq!(confirmed, 1);
        assert_eq!(agent.pending(), 0);
        assert_eq!(agent.warnings().len(), 1);
        assert_eq!(agent.warnings()[0].local_id, lost);
        assert_eq!(agent.warnings()[0].record_id, Some(record.id));
        assert!(agent.warnings()[0].reason.contains("record changed"));
        assert_eq!(agent.state(), SyncState::Live);
        Ok(())
    }

    // Test IDs: TCLIENT-003
    #[test]
    fn transport_outage_keeps_the_mutation_queued() -> Result<(), SyncError> {
        let mut agent = ClientSyncAgent::new();
        let record = seeded_complaint(1);
        agent.seed(vec![record.clone()]);
        agent.stage_update(record.id, status_patch(ComplaintStatus::Closed), Some(1))?;

        let mut down = ScriptedTransport::new(vec![Err(SyncError::TransportUnavailable(
            "connection refused".to_string(),
        ))]);
        agent.handshake_complete();
        assert_eq!(agent.reconcile(&mut down), 0);
        assert_eq!(agent.pending(), 1);
        assert_eq!(agent.state(), SyncState::Disconnected);

        // The same mutation replays intact on the next pass.
        let mut echo = record.clone();
        echo.status = ComplaintStatus::Closed;
        echo.version = 2;
        let mut up = ScriptedTransport::new(vec![ack(echo)]);
        agent.handshake_complete();
        assert_eq!(agent.reconcile(&mut up), 1);
        assert_eq!(agent.pending(), 0);
        assert_eq!(agent.state(), SyncState::Live);
        Ok(())
    }

    // Test IDs: TCLIENT-004
    #[test]
    fn already_applied_ack_confirms_without_warning() -> Result<(), SyncError> {
        let mut agent = ClientSyncAgent::new();
        let record = seeded_complaint(1);
        agent.seed(vec![record.clone()]);
        agent.stage_update(record.id, status_patch(ComplaintStatus::InProgress), Some(1))?;

        let mut echo = record.clone();
        echo.status = ComplaintStatus::InProgress;
        echo.version = 2;
        let mut transport = ScriptedTransport::new(vec![Ok(SubmitAck {
            record: Some(echo),
            already_applied: true,
        })]);

        agent.handshake_complete();
        assert_eq!(agent.reconcile(&mut transport), 1);
        assert!(agent.warnings().is_empty());
        let local = agent.record(record.id).ok_or(SyncError::NotFound(record.id))?;
        assert_eq!(local.version, 2);
        Ok(())
    }

    // Test IDs: TCLIENT-005
    #[test]
    fn provisional_create_is_replaced_by_the_authoritative_echo() -> Result<(), SyncError> {
        let mut agent = ClientSyncAgent::new();
        let field = Actor { id: ActorId::new(), role: Role::Field };
        let input = CreateComplaint {
            summary: "pallet damaged in transit".to_string(),
            priority: Priority::High,
            business_date: date!(2025 - 05 - 01),
        };

        let local_id = agent.stage_create(input, field)?;
        let provisional = agent.provisional_id(local_id).ok_or(SyncError::Validation(
            "missing provisional id".to_string(),
        ))?;
        let staged = agent.record(provisional).ok_or(SyncError::NotFound(provisional))?;
        assert_eq!(staged.sequence_number, 0);
        assert_eq!(staged.owner_id, Some(field.id));

        let mut authoritative = seeded_complaint(1);
        authoritative.summary = "pallet damaged in transit".to_string();
        authoritative.priority = Priority::High;
        authoritative.sequence_number = 7;
        authoritative.owner_id = Some(field.id);
        let echo_id = authoritative.id;
        let mut transport = ScriptedTransport::new(vec![ack(authoritative)]);

        agent.handshake_complete();
        assert_eq!(agent.reconcile(&mut transport), 1);
        assert!(agent.record(provisional).is_none());
        let confirmed = agent.record(echo_id).ok_or(SyncError::NotFound(echo_id))?;
        assert_eq!(confirmed.sequence_number, 7);
        assert!(agent.provisional_id(local_id).is_none());
        Ok(())
    }

    // Test IDs: TCLIENT-006
    #[test]
    fn cancelling_a_staged_create_retracts_the_placeholder() -> Result<(), SyncError> {
        let mut agent = ClientSyncAgent::new();
        let field = Actor { id: ActorId::new(), role: Role::Field };
        let input = CreateComplaint {
            summary: "mislabeled boxes".to_string(),
            priority: Priority::Low,
            business_date: date!(2025 - 05 - 02),
        };

        let local_id = agent.stage_create(input, field)?;
        assert_eq!(agent.pending(), 1);
        assert!(agent.cancel(local_id));
        assert_eq!(agent.pending(), 0);
        assert_eq!(agent.records().count(), 0);
        assert!(agent.provisional_id(local_id).is_none());

        // A second cancel finds nothing.
        assert!(!agent.cancel(local_id));
        Ok(())
    }

    // Test IDs: TCLIENT-007
    #[test]
    fn version_gap_drops_the_agent_back_to_reconciling() -> Result<(), SyncError> {
        let mut agent = ClientSyncAgent::new();
        let record = seeded_complaint(1);
        agent.seed(vec![record.clone()]);
        agent.handshake_complete();
        let mut transport = ScriptedTransport::new(Vec::new());
        agent.reconcile(&mut transport);
        assert_eq!(agent.state(), SyncState::Live);

        // Contiguous version: no gap.
        let mut next = record.clone();
        next.status = ComplaintStatus::InProgress;
        next.version = 2;
        agent.observe_change(&ChangeEvent {
            record_id: record.id,
            kind: ChangeKind::Updated,
            snapshot: Some(next.clone()),
        });
        assert!(!agent.gap_detected());
        assert_eq!(agent.state(), SyncState::Live);

        // Skipped version: mirror is stale.
        let mut skipped = next;
        skipped.priority = Priority::High;
        skipped.version = 4;
        agent.observe_change(&ChangeEvent {
            record_id: record.id,
            kind: ChangeKind::Updated,
            snapshot: Some(skipped),
        });
        assert!(agent.gap_detected());
        assert_eq!(agent.state(), SyncState::Reconciling);

        // A full reseed clears the gap flag.
        agent.seed(vec![record.clone()]);
        assert!(!agent.gap_detected());
        Ok(())
    }

    // Test IDs: TCLIENT-008
    #[test]
    fn reconnect_backoff_doubles_and_then_gives_up() {
        let mut agent = ClientSyncAgent::new();
        agent.connection_lost();

        let mut delays = Vec::new();
        while let Some(delay) = agent.next_reconnect_delay() {
            assert_eq!(agent.state(), SyncState::Connecting);
            delays.push(delay.as_secs());
        }

        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
        assert!(agent.sync_failed());

        // A successful handshake resets the ladder.
        agent.handshake_complete();
        assert!(!agent.sync_failed());
        assert_eq!(agent.next_reconnect_delay(), Some(Duration::from_secs(1)));
    }

    // Test IDs: TCLIENT-009
    #[test]
    fn backoff_delay_is_capped() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 8,
        };
        assert_eq!(policy.delay(4), Some(Duration::from_secs(16)));
        assert_eq!(policy.delay(5), Some(Duration::from_secs(30)));
        assert_eq!(policy.delay(7), Some(Duration::from_secs(30)));
        assert_eq!(policy.delay(8), None);
    }

    // Test IDs: TCLIENT-010
    #[test]
    fn deletion_events_and_staged_deletes_remove_the_local_record() {
        let mut agent = ClientSyncAgent::new();
        let record = seeded_complaint(1);
        let other = seeded_complaint(1);
        agent.seed(vec![record.clone(), other.clone()]);

        agent.observe_change(&ChangeEvent {
            record_id: record.id,
            kind: ChangeKind::Deleted,
            snapshot: None,
        });
        assert!(agent.record(record.id).is_none());

        agent.stage_delete(other.id);
        assert!(agent.record(other.id).is_none());
        assert_eq!(agent.pending(), 1);
    }

    // Test IDs: TCLIENT-011
    #[test]
    fn notification_frames_land_in_the_inbox() {
        let mut agent = ClientSyncAgent::new();
        let event = NotificationEvent {
            id: caseflow_core::NotificationId::new(),
            recipient_id: ActorId::new(),
            record_id: ComplaintId::new(),
            title: "Complaint Status Updated".to_string(),
            message: "Complaint #12 status changed from new to in-progress".to_string(),
            category: caseflow_core::NotificationCategory::StatusUpdate,
            created_at: datetime!(2025-05-01 10:00 UTC),
            read: false,
        };
        agent.observe_frame(&Frame::Notification(event.clone()));
        assert_eq!(agent.notifications(), &[event]);
    }
}

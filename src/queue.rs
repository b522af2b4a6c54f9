//! Durable FIFO of outbound sync operations.
//!
//! Operations are ordered by enqueue timestamp, ties broken by the local
//! sequence number. Reading a batch does not remove it: entries leave the
//! queue only through an explicit `remove` after the remote system has
//! answered for them, which gives at-least-once delivery across crashes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::error::{PosError, PosResult};
use crate::order::Order;
use crate::store::{DurableStore, RecordKey, StoredRecord, Table};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncOpType {
    CreateOrder,
    UpdateOrder,
    PayOrder,
}

impl SyncOpType {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncOpType::CreateOrder => "CREATE_ORDER",
            SyncOpType::UpdateOrder => "UPDATE_ORDER",
            SyncOpType::PayOrder => "PAY_ORDER",
        }
    }
}

/// An operation that has not been given a queue position yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncDraft {
    pub op_type: SyncOpType,
    pub payload: Order,
}

impl SyncDraft {
    pub fn new(op_type: SyncOpType, payload: Order) -> Self {
        Self { op_type, payload }
    }
}

/// One queued unit of outbound work. Never mutated once enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    /// Local sequence number. Lives in the table key, not in the document,
    /// and never leaves the device.
    #[serde(skip)]
    pub id: i64,
    #[serde(rename = "type")]
    pub op_type: SyncOpType,
    pub order_id: String,
    pub payload: Order,
    /// Enqueue time in ms since the epoch.
    pub timestamp: i64,
}

impl SyncOperation {
    /// Key the remote system uses to recognise a resent operation. Stable
    /// across retries because it only depends on the snapshot version.
    pub fn idempotency_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.order_id,
            self.payload.version,
            self.op_type.as_str()
        )
    }

    fn from_record(record: &StoredRecord) -> PosResult<Self> {
        let mut op: SyncOperation = record.decode()?;
        op.id = match record.key {
            Some(RecordKey::Seq(seq)) => seq,
            ref other => {
                return Err(PosError::StorageUnavailable(format!(
                    "sync_queue record with unexpected key {other:?}"
                )))
            }
        };
        Ok(op)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    Permanent,
    Conflict,
    /// The queued row could not be decoded.
    Corrupt,
}

/// An operation taken out of the queue without an acknowledgement. Kept in
/// `sync_rejections` for manual reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRejection {
    pub operation_id: i64,
    pub kind: RejectionKind,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<SyncOperation>,
    /// Stored document of a row that failed to decode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
    pub rejected_at: DateTime<Utc>,
}

impl SyncRejection {
    pub fn new(op: &SyncOperation, kind: RejectionKind, reason: impl Into<String>) -> Self {
        Self {
            operation_id: op.id,
            kind,
            reason: reason.into(),
            idempotency_key: Some(op.idempotency_key()),
            operation: Some(op.clone()),
            raw: None,
            rejected_at: Utc::now(),
        }
    }

    pub fn order_id(&self) -> Option<&str> {
        self.operation.as_ref().map(|op| op.order_id.as_str())
    }

    pub fn to_error(&self) -> PosError {
        match self.kind {
            RejectionKind::Conflict => PosError::Conflict {
                order_id: self.order_id().unwrap_or_default().to_string(),
                reason: self.reason.clone(),
            },
            RejectionKind::Permanent | RejectionKind::Corrupt => {
                PosError::PermanentSyncRejection {
                    operation_id: self
                        .idempotency_key
                        .clone()
                        .unwrap_or_else(|| format!("#{}", self.operation_id)),
                    reason: self.reason.clone(),
                }
            }
        }
    }
}

pub struct SyncQueue {
    store: Arc<dyn DurableStore>,
    /// Highest timestamp handed out so far; enqueue never goes below it.
    last_timestamp: AtomicI64,
}

impl SyncQueue {
    /// Open the queue over `store`, resuming after whatever is already queued.
    pub fn open(store: Arc<dyn DurableStore>) -> PosResult<Self> {
        let pending = store.get_all(Table::SyncQueue)?;
        let last = pending.iter().map(|r| r.ts).max().unwrap_or(0);
        if !pending.is_empty() {
            info!(pending = pending.len(), "Sync queue resumed with pending operations");
        }
        Ok(Self {
            store,
            last_timestamp: AtomicI64::new(last),
        })
    }

    pub fn enqueue(&self, draft: SyncDraft) -> PosResult<SyncOperation> {
        self.enqueue_at(draft, Utc::now().timestamp_millis())
    }

    /// Enqueue with an explicit clock reading. A reading older than the last
    /// enqueue is clamped forward so FIFO order follows enqueue order.
    pub fn enqueue_at(&self, draft: SyncDraft, now_ms: i64) -> PosResult<SyncOperation> {
        let previous = self.last_timestamp.fetch_max(now_ms, Ordering::SeqCst);
        let timestamp = previous.max(now_ms);

        let mut op = SyncOperation {
            id: 0,
            op_type: draft.op_type,
            order_id: draft.payload.id.clone(),
            payload: draft.payload,
            timestamp,
        };
        let record = StoredRecord::encode(None, &op, timestamp)?;
        op.id = match self.store.put(Table::SyncQueue, record)? {
            RecordKey::Seq(seq) => seq,
            other => {
                return Err(PosError::StorageUnavailable(format!(
                    "sync_queue returned non-sequence key {other}"
                )))
            }
        };

        debug!(
            op_id = op.id,
            order_id = %op.order_id,
            op_type = op.op_type.as_str(),
            "Sync operation enqueued"
        );
        Ok(op)
    }

    /// Oldest `max_size` operations in FIFO order. Does not remove anything,
    /// except rows that no longer decode: those move to `sync_rejections` so
    /// they cannot block the head of the queue.
    pub fn peek_batch(&self, max_size: usize) -> PosResult<Vec<SyncOperation>> {
        if max_size == 0 {
            return Ok(Vec::new());
        }
        loop {
            let records = self.store.scan(Table::SyncQueue, Some(max_size))?;
            let (ops, quarantined) = self.decode_all(&records)?;
            if quarantined == 0 || records.len() < max_size {
                return Ok(ops);
            }
        }
    }

    /// Every pending operation in FIFO order.
    pub fn pending(&self) -> PosResult<Vec<SyncOperation>> {
        let records = self.store.get_all(Table::SyncQueue)?;
        Ok(self.decode_all(&records)?.0)
    }

    fn decode_all(&self, records: &[StoredRecord]) -> PosResult<(Vec<SyncOperation>, usize)> {
        let mut ops = Vec::with_capacity(records.len());
        let mut quarantined = 0;
        for record in records {
            match SyncOperation::from_record(record) {
                Ok(op) => ops.push(op),
                Err(e) => {
                    self.quarantine(record, &e)?;
                    quarantined += 1;
                }
            }
        }
        Ok((ops, quarantined))
    }

    fn quarantine(&self, record: &StoredRecord, cause: &PosError) -> PosResult<()> {
        let Some(RecordKey::Seq(seq)) = record.key else {
            return Err(cause.clone());
        };
        let rejection = SyncRejection {
            operation_id: seq,
            kind: RejectionKind::Corrupt,
            reason: cause.to_string(),
            idempotency_key: None,
            operation: None,
            raw: Some(record.doc.clone()),
            rejected_at: Utc::now(),
        };
        self.record_rejection(&rejection)?;
        self.store.delete(Table::SyncQueue, &RecordKey::Seq(seq))?;
        error!(op_id = seq, error = %cause, "Undecodable sync operation moved to sync_rejections");
        Ok(())
    }

    /// Persist a rejection. Written before the operation leaves the queue so
    /// nothing is lost if the process stops in between.
    pub fn record_rejection(&self, rejection: &SyncRejection) -> PosResult<()> {
        let record = StoredRecord::encode(
            Some(RecordKey::Seq(rejection.operation_id)),
            rejection,
            rejection.rejected_at.timestamp_millis(),
        )?;
        self.store.put(Table::Rejections, record)?;
        Ok(())
    }

    /// Rejected operations, oldest first.
    pub fn rejections(&self) -> PosResult<Vec<SyncRejection>> {
        self.store
            .get_all(Table::Rejections)?
            .iter()
            .map(StoredRecord::decode)
            .collect()
    }

    /// Remove the given operations. Unknown ids are ignored.
    pub fn remove(&self, ids: &[i64]) -> PosResult<usize> {
        let keys: Vec<RecordKey> = ids.iter().copied().map(RecordKey::Seq).collect();
        let removed = self.store.delete_many(Table::SyncQueue, &keys)?;
        debug!(requested = ids.len(), removed, "Sync operations removed");
        Ok(removed)
    }

    /// Queue depth, the read-only counter exposed for telemetry.
    pub fn depth(&self) -> PosResult<u64> {
        self.store.count(Table::SyncQueue)
    }
}

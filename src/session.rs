//! Order session controller.
//!
//! Owns the order currently open at the terminal. Every accepted action goes
//! through the pure reducer, is written to the `orders` table and then turned
//! into a sync operation. When the write fails the terminal keeps working on
//! the in-memory order: the missed enqueues are held back and replayed, in
//! order, by the next successful write.

use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::dispatcher::AckedOperation;
use crate::error::{PosError, PosResult};
use crate::fiscal::{FiscalReceipt, FiscalSigner};
use crate::order::{ensure_payable, transition, Order, OrderAction, PaymentMethod};
use crate::queue::{SyncDraft, SyncOpType, SyncOperation, SyncQueue};
use crate::store::{DurableStore, RecordKey, StoredRecord, Table};

/// Whether the observed order has also reached disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Durability {
    Durable,
    /// Held in memory only; the error is the storage failure that deferred it.
    Deferred(PosError),
}

impl Durability {
    pub fn is_durable(&self) -> bool {
        matches!(self, Durability::Durable)
    }
}

#[derive(Debug, Clone)]
pub struct DispatchReceipt {
    /// Order as the terminal now shows it.
    pub order: Order,
    pub changed: bool,
    pub durability: Durability,
    /// Operations that reached the queue during this call, oldest first.
    /// May include operations deferred by earlier calls.
    pub enqueued: Vec<SyncOperation>,
}

fn sync_type_for(action: &OrderAction) -> SyncOpType {
    match action {
        OrderAction::Pay { .. } => SyncOpType::PayOrder,
        _ => SyncOpType::UpdateOrder,
    }
}

pub struct OrderSession {
    store: Arc<dyn DurableStore>,
    queue: Arc<SyncQueue>,
    signer: Arc<dyn FiscalSigner>,
    active: Option<Order>,
    /// False while `active` differs from what is on disk.
    durable: bool,
    deferred: VecDeque<SyncDraft>,
}

impl OrderSession {
    pub fn new(
        store: Arc<dyn DurableStore>,
        queue: Arc<SyncQueue>,
        signer: Arc<dyn FiscalSigner>,
    ) -> Self {
        Self {
            store,
            queue,
            signer,
            active: None,
            durable: true,
            deferred: VecDeque::new(),
        }
    }

    /// Start a fresh `OPEN` order and queue its `CREATE_ORDER`.
    ///
    /// Refuses to replace an active order whose state has not reached disk
    /// yet, since that state would otherwise be lost.
    pub fn open_order(&mut self) -> PosResult<DispatchReceipt> {
        self.settle_active()?;

        let order = Order::create(Utc::now());
        info!(order_id = %order.id, "Order opened");
        let draft = SyncDraft::new(SyncOpType::CreateOrder, order.clone());
        Ok(self.commit(order, true, Some(draft)))
    }

    /// Make a durable order active again, typically after a restart.
    pub fn resume(&mut self, order_id: &str) -> PosResult<Order> {
        self.settle_active()?;

        let record = self
            .store
            .get(Table::Orders, &RecordKey::Text(order_id.to_string()))?
            .ok_or_else(|| PosError::NotFound(format!("order {order_id}")))?;
        let order: Order = record.decode()?;
        info!(order_id = %order.id, status = order.status.as_str(), "Order resumed");
        self.active = Some(order.clone());
        self.durable = true;
        Ok(order)
    }

    /// Apply `action` to the active order.
    ///
    /// Validation failures return `Err` and leave everything untouched. A
    /// storage failure is not an error here: the new state is kept in memory
    /// and the receipt reports it as `Deferred`.
    pub fn dispatch(&mut self, action: OrderAction) -> PosResult<DispatchReceipt> {
        let prior = self
            .active
            .as_ref()
            .ok_or_else(|| PosError::Validation("no active order".into()))?;
        let step = transition(prior, &action, Utc::now())?;

        debug!(
            order_id = %step.order.id,
            action = action.name(),
            changed = step.changed,
            status = step.order.status.as_str(),
            "Order action applied"
        );

        if !step.changed {
            return Ok(self.commit(step.order, false, None));
        }
        let draft = SyncDraft::new(sync_type_for(&action), step.order.clone());
        Ok(self.commit(step.order, true, Some(draft)))
    }

    /// Obtain a fiscal signature and pay the active order.
    ///
    /// If the signer fails nothing changes: the order keeps its pre-payment
    /// state and no operation is queued.
    pub fn pay(&mut self, method: PaymentMethod) -> PosResult<DispatchReceipt> {
        let order = self
            .active
            .as_ref()
            .ok_or_else(|| PosError::Validation("no active order".into()))?;
        ensure_payable(order)?;
        let receipt = FiscalReceipt::from_order(order, method)?;

        let fiscal_signature = self.signer.sign(&receipt).map_err(|e| match e {
            PosError::FiscalSigning(_) => e,
            other => PosError::FiscalSigning(other.to_string()),
        });
        let fiscal_signature = match fiscal_signature {
            Ok(signature) => signature,
            Err(e) => {
                warn!(order_id = %receipt.order_id, error = %e, "Fiscal signing failed; order not paid");
                return Err(e);
            }
        };

        self.dispatch(OrderAction::Pay {
            method,
            fiscal_signature,
        })
    }

    /// Retry a deferred write without applying a new action.
    pub fn retry_persist(&mut self) -> PosResult<DispatchReceipt> {
        let order = self
            .active
            .clone()
            .ok_or_else(|| PosError::Validation("no active order".into()))?;
        let (durability, enqueued) = self.flush();
        Ok(DispatchReceipt {
            order,
            changed: false,
            durability,
            enqueued,
        })
    }

    /// Record that the remote system has the snapshot in `ack`.
    ///
    /// Marks the order `synced` only when the acknowledged snapshot is still
    /// the current one. Returns whether anything was marked.
    pub fn acknowledge(&mut self, ack: &AckedOperation) -> bool {
        if let Some(active) = self.active.as_mut() {
            if active.id == ack.order_id {
                if active.synced || active.version != ack.order_version {
                    return false;
                }
                active.synced = true;
                if self.durable && self.deferred.is_empty() {
                    if let Err(e) = self.persist_active() {
                        warn!(order_id = %ack.order_id, error = %e, "Failed to persist synced flag");
                        self.durable = false;
                    }
                }
                return true;
            }
        }

        // Not the active order: update the stored copy directly.
        match mark_order_synced(self.store.as_ref(), ack) {
            Ok(marked) => marked,
            Err(e) => {
                warn!(order_id = %ack.order_id, error = %e, "Failed to mark stored order synced");
                false
            }
        }
    }

    /// The order as the terminal currently shows it.
    pub fn observed(&self) -> Option<&Order> {
        self.active.as_ref()
    }

    /// Whether the observed order and all of its operations are on disk.
    pub fn is_durable(&self) -> bool {
        self.durable && self.deferred.is_empty()
    }

    /// Number of sync operations waiting for the next successful write.
    pub fn pending_enqueues(&self) -> usize {
        self.deferred.len()
    }

    fn settle_active(&mut self) -> PosResult<()> {
        if self.is_durable() {
            return Ok(());
        }
        match self.flush() {
            (Durability::Durable, _) => Ok(()),
            (Durability::Deferred(e), _) => Err(PosError::StorageUnavailable(format!(
                "active order has unsaved changes: {e}"
            ))),
        }
    }

    fn commit(&mut self, order: Order, changed: bool, draft: Option<SyncDraft>) -> DispatchReceipt {
        let observed = order.clone();
        self.active = Some(order);
        if changed {
            self.durable = false;
        }
        if let Some(draft) = draft {
            self.deferred.push_back(draft);
        }

        let (durability, enqueued) = if self.is_durable() {
            (Durability::Durable, Vec::new())
        } else {
            self.flush()
        };

        DispatchReceipt {
            order: observed,
            changed,
            durability,
            enqueued,
        }
    }

    /// Write the active order, then enqueue the held-back operations in order.
    fn flush(&mut self) -> (Durability, Vec<SyncOperation>) {
        let mut enqueued = Vec::new();

        if !self.durable {
            if let Err(e) = self.persist_active() {
                warn!(
                    order_id = self.active.as_ref().map(|o| o.id.as_str()).unwrap_or_default(),
                    pending_enqueues = self.deferred.len(),
                    error = %e,
                    "Order write failed; keeping state in memory"
                );
                return (Durability::Deferred(e), enqueued);
            }
            self.durable = true;
        }

        while let Some(draft) = self.deferred.front().cloned() {
            match self.queue.enqueue(draft) {
                Ok(op) => {
                    self.deferred.pop_front();
                    enqueued.push(op);
                }
                Err(e) => {
                    warn!(
                        pending_enqueues = self.deferred.len(),
                        error = %e,
                        "Sync enqueue failed; will retry on next write"
                    );
                    return (Durability::Deferred(e), enqueued);
                }
            }
        }

        (Durability::Durable, enqueued)
    }

    fn persist_active(&self) -> PosResult<()> {
        let Some(order) = self.active.as_ref() else {
            return Ok(());
        };
        let record = StoredRecord::encode(
            Some(RecordKey::Text(order.id.clone())),
            order,
            order.updated_at_ms(),
        )?;
        self.store.put(Table::Orders, record)?;
        Ok(())
    }
}

/// Mark the stored copy of `ack.order_id` as synced if the acknowledged
/// snapshot is still the stored one. Used for orders no session holds open.
///
/// The version check and the write happen in one store update, so a newer
/// snapshot written concurrently is never overwritten.
pub fn mark_order_synced(store: &dyn DurableStore, ack: &AckedOperation) -> PosResult<bool> {
    let key = RecordKey::Text(ack.order_id.clone());
    let marked = store.update(Table::Orders, &key, &mut |record| {
        let mut order: Order = record.decode()?;
        if order.synced || order.version != ack.order_version {
            return Ok(false);
        }
        order.synced = true;
        record.doc = serde_json::to_value(&order)?;
        Ok(true)
    })?;
    if marked {
        debug!(order_id = %ack.order_id, version = ack.order_version, "Order marked synced");
    }
    Ok(marked)
}

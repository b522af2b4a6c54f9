//! Order data model and the order state machine.
//!
//! `transition` is a pure reducer: it takes the prior order, an action and the
//! current clock reading, and returns the next order. It performs no I/O, so
//! callers can replay it or own it from any thread.
//!
//! Lifecycle: `OPEN -> SENT -> PAID -> CLOSED`, with `VOID` reachable from any
//! non-terminal state. `CLOSED` and `VOID` are terminal.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PosError, PosResult};

/// Course assigned to items added without an explicit course.
pub const DEFAULT_COURSE: u32 = 1;

/// Tax rates are stored in basis points (2400 = 24%).
const BASIS_POINTS: i128 = 10_000;

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Open,
    Sent,
    Paid,
    Closed,
    Void,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Closed | OrderStatus::Void)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Open => "OPEN",
            OrderStatus::Sent => "SENT",
            OrderStatus::Paid => "PAID",
            OrderStatus::Closed => "CLOSED",
            OrderStatus::Void => "VOID",
        }
    }
}

/// Kitchen status of one line. Ordered so that a later status compares
/// greater; items only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Held,
    Fired,
    Served,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    Cash,
    Card,
    Voucher,
    Mobile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub menu_item_id: String,
    pub name: String,
    pub quantity: u32,
    pub price_cents: i64,
    /// Tax rate in basis points, captured at the time of sale.
    pub tax_rate_snapshot: u32,
    pub course: u32,
    pub status: ItemStatus,
}

impl OrderItem {
    pub fn line_subtotal(&self) -> Option<i64> {
        self.price_cents.checked_mul(i64::from(self.quantity))
    }

    /// Line tax rounded half-up to whole cents.
    pub fn line_tax(&self) -> Option<i64> {
        let base = i128::from(self.line_subtotal()?);
        let tax = (base * i128::from(self.tax_rate_snapshot) + BASIS_POINTS / 2) / BASIS_POINTS;
        i64::try_from(tax).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub status: OrderStatus,
    pub items: Vec<OrderItem>,
    pub subtotal: i64,
    pub tax: i64,
    pub total: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fiscal_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<PaymentMethod>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped by every state-changing transition. Identifies a snapshot.
    #[serde(default)]
    pub version: u64,
    pub synced: bool,
}

impl Order {
    /// A fresh, empty `OPEN` order with the given id.
    pub fn new(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        let now = truncate_to_millis(now);
        Self {
            id: id.into(),
            status: OrderStatus::Open,
            items: Vec::new(),
            subtotal: 0,
            tax: 0,
            total: 0,
            fiscal_signature: None,
            payment_method: None,
            created_at: now,
            updated_at: now,
            version: 0,
            synced: false,
        }
    }

    /// A fresh order with a client-generated UUID.
    pub fn create(now: DateTime<Utc>) -> Self {
        Self::new(Uuid::new_v4().to_string(), now)
    }

    pub fn updated_at_ms(&self) -> i64 {
        self.updated_at.timestamp_millis()
    }
}

/// Item as entered at the terminal, before it joins an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewItem {
    #[serde(default)]
    pub menu_item_id: String,
    pub name: String,
    pub quantity: u32,
    pub price_cents: i64,
    /// Basis points; 0 when the item is untaxed.
    #[serde(default)]
    pub tax_rate_bps: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course: Option<u32>,
}

impl NewItem {
    pub fn new(name: impl Into<String>, price_cents: i64, quantity: u32) -> Self {
        let name = name.into();
        Self {
            menu_item_id: name.to_lowercase().replace(' ', "-"),
            name,
            quantity,
            price_cents,
            tax_rate_bps: 0,
            course: None,
        }
    }

    pub fn with_tax_rate(mut self, bps: u32) -> Self {
        self.tax_rate_bps = bps;
        self
    }

    pub fn in_course(mut self, course: u32) -> Self {
        self.course = Some(course);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderAction {
    AddItem(NewItem),
    FireCourse {
        course: u32,
    },
    ServeCourse {
        course: u32,
    },
    #[serde(rename_all = "camelCase")]
    Pay {
        method: PaymentMethod,
        fiscal_signature: String,
    },
    Void,
    Close,
}

impl OrderAction {
    pub fn name(&self) -> &'static str {
        match self {
            OrderAction::AddItem(_) => "ADD_ITEM",
            OrderAction::FireCourse { .. } => "FIRE_COURSE",
            OrderAction::ServeCourse { .. } => "SERVE_COURSE",
            OrderAction::Pay { .. } => "PAY",
            OrderAction::Void => "VOID",
            OrderAction::Close => "CLOSE",
        }
    }
}

/// Result of applying one action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub order: Order,
    /// False when the action left the order exactly as it was.
    pub changed: bool,
}

// ---------------------------------------------------------------------------
// Reducer
// ---------------------------------------------------------------------------

fn require(order: &Order, allowed: &[OrderStatus], action: &str) -> PosResult<()> {
    if allowed.contains(&order.status) {
        Ok(())
    } else {
        Err(PosError::Validation(format!(
            "{action} is not allowed on a {} order",
            order.status.as_str()
        )))
    }
}

/// Check that `PAY` would be accepted, without a signature in hand. Lets the
/// caller avoid asking the fiscal device to sign an order it cannot pay.
pub fn ensure_payable(order: &Order) -> PosResult<()> {
    require(order, &[OrderStatus::Open, OrderStatus::Sent], "PAY")?;
    if order.items.is_empty() {
        return Err(PosError::Validation(format!(
            "order {} has no items to pay for",
            order.id
        )));
    }
    Ok(())
}

fn validate_new_item(item: &NewItem) -> PosResult<()> {
    if item.name.trim().is_empty() {
        return Err(PosError::Validation("item name must not be empty".into()));
    }
    if item.quantity == 0 {
        return Err(PosError::Validation(format!(
            "quantity for {} must be greater than zero",
            item.name
        )));
    }
    if item.price_cents < 0 {
        return Err(PosError::Validation(format!(
            "price for {} must not be negative",
            item.name
        )));
    }
    if item.course == Some(0) {
        return Err(PosError::Validation("course numbers start at 1".into()));
    }
    Ok(())
}

fn recompute_totals(order: &mut Order) -> PosResult<()> {
    let id = order.id.clone();
    let overflow = || PosError::Validation(format!("order {id} total overflows"));
    let mut subtotal: i64 = 0;
    let mut tax: i64 = 0;
    for item in &order.items {
        subtotal = item
            .line_subtotal()
            .and_then(|line| subtotal.checked_add(line))
            .ok_or_else(overflow)?;
        tax = item
            .line_tax()
            .and_then(|line| tax.checked_add(line))
            .ok_or_else(overflow)?;
    }
    order.subtotal = subtotal;
    order.tax = tax;
    order.total = subtotal.checked_add(tax).ok_or_else(overflow)?;
    Ok(())
}

fn truncate_to_millis(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(t.timestamp_millis()).unwrap_or(t)
}

/// `updatedAt` moves forward by at least one whole millisecond per change,
/// even if the wall clock stalls or steps back.
fn next_timestamp(prior: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let floor = prior.timestamp_millis().saturating_add(1);
    let next = now.timestamp_millis().max(floor);
    DateTime::from_timestamp_millis(next).unwrap_or(prior + Duration::milliseconds(1))
}

/// Apply `action` to `prior`.
///
/// Invalid actions return `PosError::Validation` and never produce a state.
/// A state-changing transition clears `synced`, bumps `version` and moves
/// `updated_at` to a later millisecond.
pub fn transition(
    prior: &Order,
    action: &OrderAction,
    now: DateTime<Utc>,
) -> PosResult<Transition> {
    let mut next = prior.clone();

    match action {
        OrderAction::AddItem(item) => {
            require(prior, &[OrderStatus::Open], action.name())?;
            validate_new_item(item)?;
            next.items.push(OrderItem {
                menu_item_id: item.menu_item_id.clone(),
                name: item.name.trim().to_string(),
                quantity: item.quantity,
                price_cents: item.price_cents,
                tax_rate_snapshot: item.tax_rate_bps,
                course: item.course.unwrap_or(DEFAULT_COURSE),
                status: ItemStatus::Held,
            });
        }
        OrderAction::FireCourse { course } => {
            require(prior, &[OrderStatus::Open, OrderStatus::Sent], action.name())?;
            next.status = OrderStatus::Sent;
            next.items
                .iter_mut()
                .filter(|item| item.course == *course && item.status == ItemStatus::Held)
                .for_each(|item| item.status = ItemStatus::Fired);
        }
        OrderAction::ServeCourse { course } => {
            require(prior, &[OrderStatus::Sent, OrderStatus::Paid], action.name())?;
            next.items
                .iter_mut()
                .filter(|item| item.course == *course && item.status == ItemStatus::Fired)
                .for_each(|item| item.status = ItemStatus::Served);
        }
        OrderAction::Pay {
            method,
            fiscal_signature,
        } => {
            ensure_payable(prior)?;
            if fiscal_signature.trim().is_empty() {
                return Err(PosError::Validation(
                    "PAY requires a fiscal signature".into(),
                ));
            }
            next.status = OrderStatus::Paid;
            next.payment_method = Some(*method);
            next.fiscal_signature = Some(fiscal_signature.clone());
        }
        OrderAction::Void => {
            if prior.status.is_terminal() {
                return Err(PosError::Validation(format!(
                    "VOID is not allowed on a {} order",
                    prior.status.as_str()
                )));
            }
            next.status = OrderStatus::Void;
        }
        OrderAction::Close => {
            require(prior, &[OrderStatus::Paid], action.name())?;
            next.status = OrderStatus::Closed;
        }
    }

    recompute_totals(&mut next)?;

    let changed = next != *prior;
    if changed {
        next.synced = false;
        next.version = prior.version.saturating_add(1);
        next.updated_at = next_timestamp(prior.updated_at, now);
    }

    Ok(Transition {
        order: next,
        changed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn apply(order: &Order, action: OrderAction) -> Order {
        transition(order, &action, t0() + Duration::seconds(1))
            .expect("valid transition")
            .order
    }

    fn pay(method: PaymentMethod) -> OrderAction {
        OrderAction::Pay {
            method,
            fiscal_signature: "SIG-1".into(),
        }
    }

    #[test]
    fn test_pizza_walkthrough() {
        let order = Order::new("o1", t0());
        let order = apply(&order, OrderAction::AddItem(NewItem::new("Pizza", 1200, 2)));
        assert_eq!(order.subtotal, 2400);
        assert_eq!(order.total, 2400);
        assert_eq!(order.items.len(), 1);
        assert_eq!(order.items[0].course, DEFAULT_COURSE);
        assert_eq!(order.items[0].status, ItemStatus::Held);

        let order = apply(&order, OrderAction::FireCourse { course: 1 });
        assert_eq!(order.status, OrderStatus::Sent);
        assert_eq!(order.items[0].status, ItemStatus::Fired);

        let order = apply(&order, pay(PaymentMethod::Cash));
        assert_eq!(order.status, OrderStatus::Paid);
        assert_eq!(order.fiscal_signature.as_deref(), Some("SIG-1"));
        assert_eq!(order.payment_method, Some(PaymentMethod::Cash));
    }

    #[test]
    fn test_tax_is_rounded_per_line_half_up() {
        let order = Order::new("o-tax", t0());
        // 3 x 333 = 999 at 24% = 239.76 -> 240
        let order = apply(
            &order,
            OrderAction::AddItem(NewItem::new("Espresso", 333, 3).with_tax_rate(2400)),
        );
        // 1 x 50 at 13% = 6.5 -> 7
        let order = apply(
            &order,
            OrderAction::AddItem(NewItem::new("Water", 50, 1).with_tax_rate(1300)),
        );
        assert_eq!(order.subtotal, 1049);
        assert_eq!(order.tax, 247);
        assert_eq!(order.total, 1296);
    }

    #[test]
    fn test_add_item_rejected_outside_open() {
        let order = apply(&Order::new("o2", t0()), OrderAction::FireCourse { course: 1 });
        let err = transition(
            &order,
            &OrderAction::AddItem(NewItem::new("Soup", 500, 1)),
            t0(),
        )
        .unwrap_err();
        assert!(matches!(err, PosError::Validation(_)));
    }

    #[test]
    fn test_add_item_validates_fields() {
        let order = Order::new("o3", t0());
        for bad in [
            NewItem::new("Zero", 100, 0),
            NewItem::new("Negative", -1, 1),
            NewItem::new("  ", 100, 1),
            NewItem::new("Course zero", 100, 1).in_course(0),
        ] {
            let err = transition(&order, &OrderAction::AddItem(bad), t0()).unwrap_err();
            assert!(matches!(err, PosError::Validation(_)));
        }
    }

    #[test]
    fn test_fire_course_only_touches_held_items_of_that_course() {
        let mut order = Order::new("o4", t0());
        order = apply(&order, OrderAction::AddItem(NewItem::new("Salad", 700, 1)));
        order = apply(
            &order,
            OrderAction::AddItem(NewItem::new("Steak", 2500, 1).in_course(2)),
        );
        order = apply(&order, OrderAction::FireCourse { course: 1 });
        assert_eq!(order.items[0].status, ItemStatus::Fired);
        assert_eq!(order.items[1].status, ItemStatus::Held);

        order = apply(&order, OrderAction::ServeCourse { course: 1 });
        assert_eq!(order.items[0].status, ItemStatus::Served);

        // Re-firing course 1 must not pull the served item back.
        order = apply(&order, OrderAction::FireCourse { course: 1 });
        assert_eq!(order.items[0].status, ItemStatus::Served);
    }

    #[test]
    fn test_fire_course_is_idempotent() {
        let order = apply(
            &Order::new("o5", t0()),
            OrderAction::AddItem(NewItem::new("Fries", 300, 1)),
        );
        let once = transition(&order, &OrderAction::FireCourse { course: 1 }, t0() + Duration::seconds(5))
            .unwrap();
        let twice = transition(
            &once.order,
            &OrderAction::FireCourse { course: 1 },
            t0() + Duration::seconds(9),
        )
        .unwrap();
        assert!(once.changed);
        assert!(!twice.changed);
        assert_eq!(once.order, twice.order);
    }

    #[test]
    fn test_pay_rules() {
        let open = apply(
            &Order::new("o6", t0()),
            OrderAction::AddItem(NewItem::new("Bagel", 250, 1)),
        );
        // Walk-in quick sale: OPEN -> PAID directly.
        let paid = apply(&open, pay(PaymentMethod::Card));
        assert_eq!(paid.status, OrderStatus::Paid);

        assert!(transition(&paid, &pay(PaymentMethod::Card), t0()).is_err());

        let empty_sig = OrderAction::Pay {
            method: PaymentMethod::Cash,
            fiscal_signature: " ".into(),
        };
        assert!(transition(&open, &empty_sig, t0()).is_err());

        let closed = apply(&paid, OrderAction::Close);
        assert_eq!(closed.status, OrderStatus::Closed);
        assert!(ensure_payable(&closed).is_err());
    }

    #[test]
    fn test_void_keeps_item_statuses() {
        let mut order = apply(
            &Order::new("o7", t0()),
            OrderAction::AddItem(NewItem::new("Cake", 450, 1)),
        );
        order = apply(&order, OrderAction::FireCourse { course: 1 });
        let voided = apply(&order, OrderAction::Void);
        assert_eq!(voided.status, OrderStatus::Void);
        assert_eq!(voided.items[0].status, ItemStatus::Fired);

        assert!(transition(&voided, &OrderAction::Void, t0()).is_err());
        let closed = apply(&apply(&order, pay(PaymentMethod::Cash)), OrderAction::Close);
        assert!(transition(&closed, &OrderAction::Void, t0()).is_err());
    }

    #[test]
    fn test_updated_at_strictly_increases_even_with_stalled_clock() {
        let order = Order::new("o8", t0());
        let stalled = t0() - Duration::seconds(30);
        let next = transition(
            &order,
            &OrderAction::AddItem(NewItem::new("Tea", 200, 1)),
            stalled,
        )
        .unwrap()
        .order;
        assert!(next.updated_at > order.updated_at);
        assert!(!next.synced);
    }

    /// Every sequence of up to four actions from a small alphabet: whatever is
    /// accepted must keep the totals invariant, keep `updatedAt` monotonic and
    /// never move an item backwards.
    #[test]
    fn test_invariants_hold_for_all_short_action_sequences() {
        let alphabet = vec![
            OrderAction::AddItem(NewItem::new("Pizza", 1200, 2).with_tax_rate(2400)),
            OrderAction::AddItem(NewItem::new("Wine", 899, 1).with_tax_rate(1300).in_course(2)),
            OrderAction::FireCourse { course: 1 },
            OrderAction::FireCourse { course: 2 },
            OrderAction::ServeCourse { course: 1 },
            pay(PaymentMethod::Cash),
            OrderAction::Void,
            OrderAction::Close,
        ];

        let mut frontier = vec![Order::new("seq", t0())];
        let mut clock = t0();
        for _depth in 0..4 {
            let mut next_frontier = Vec::new();
            for order in &frontier {
                for action in &alphabet {
                    clock += Duration::milliseconds(1);
                    let Ok(step) = transition(order, action, clock) else {
                        continue;
                    };
                    let next = step.order;
                    assert_eq!(next.total, next.subtotal + next.tax);
                    assert!(next.updated_at >= order.updated_at);
                    if step.changed {
                        assert!(next.updated_at_ms() > order.updated_at_ms());
                        assert_eq!(next.version, order.version + 1);
                        assert!(!next.synced);
                    } else {
                        assert_eq!(&next, order);
                    }
                    for (before, after) in order.items.iter().zip(&next.items) {
                        assert!(after.status >= before.status, "item regressed");
                    }
                    assert!(next.items.len() >= order.items.len());
                    next_frontier.push(next);
                }
            }
            frontier = next_frontier;
        }
    }

    #[test]
    fn test_changes_within_one_millisecond_get_distinct_snapshots() {
        let base = Order::new("o9", t0());
        let first = transition(
            &base,
            &OrderAction::AddItem(NewItem::new("Olives", 400, 1)),
            t0() + Duration::microseconds(1_100),
        )
        .unwrap()
        .order;
        let second = transition(
            &first,
            &OrderAction::AddItem(NewItem::new("Bread", 300, 1)),
            t0() + Duration::microseconds(1_200),
        )
        .unwrap()
        .order;

        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert!(second.updated_at_ms() > first.updated_at_ms());
        assert_eq!(first.updated_at.timestamp_subsec_nanos() % 1_000_000, 0);
    }

    #[test]
    fn test_pay_requires_items() {
        let empty = Order::new("o10", t0());
        assert!(matches!(ensure_payable(&empty), Err(PosError::Validation(_))));
        assert!(matches!(
            transition(&empty, &pay(PaymentMethod::Cash), t0()),
            Err(PosError::Validation(_))
        ));
    }

    #[test]
    fn test_action_wire_format() {
        let action: OrderAction = serde_json::from_value(serde_json::json!({
            "type": "ADD_ITEM",
            "name": "Pizza",
            "priceCents": 1200,
            "quantity": 2
        }))
        .unwrap();
        assert!(matches!(action, OrderAction::AddItem(ref item) if item.course.is_none()));

        let pay: OrderAction = serde_json::from_value(serde_json::json!({
            "type": "PAY",
            "method": "CASH",
            "fiscalSignature": "SIG-1"
        }))
        .unwrap();
        assert_eq!(pay.name(), "PAY");
    }
}

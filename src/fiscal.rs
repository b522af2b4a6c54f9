//! Fiscal signing collaborator.
//!
//! The terminal never computes fiscal signatures itself. Before an order can
//! be paid, the session builds a `FiscalReceipt` from the order and hands it
//! to a `FiscalSigner` (cash register, fiscal printer, remote signing
//! service). The signature it returns is recorded verbatim.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PosError, PosResult};
use crate::order::{Order, PaymentMethod};

/// A single line item on a fiscal receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FiscalLineItem {
    pub description: String,
    pub quantity: u32,
    /// Unit price in cents.
    pub unit_price: i64,
    /// Tax rate in basis points as captured at sale time.
    pub tax_rate_bps: u32,
    pub line_total: i64,
}

/// Everything a signing device needs to sign one payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FiscalReceipt {
    pub order_id: String,
    pub items: Vec<FiscalLineItem>,
    pub subtotal: i64,
    pub tax: i64,
    pub total: i64,
    pub method: PaymentMethod,
}

impl FiscalReceipt {
    /// Build the receipt for paying `order` with `method`.
    pub fn from_order(order: &Order, method: PaymentMethod) -> PosResult<Self> {
        if order.items.is_empty() {
            return Err(PosError::Validation(format!(
                "order {} has no items to pay for",
                order.id
            )));
        }

        let items = order
            .items
            .iter()
            .map(|item| FiscalLineItem {
                description: item.name.clone(),
                quantity: item.quantity,
                unit_price: item.price_cents,
                tax_rate_bps: item.tax_rate_snapshot,
                line_total: item.line_subtotal().unwrap_or(i64::MAX),
            })
            .collect::<Vec<_>>();

        debug!(
            order_id = %order.id,
            "Built fiscal receipt: {} items, total {}",
            items.len(),
            order.total
        );

        Ok(Self {
            order_id: order.id.clone(),
            items,
            subtotal: order.subtotal,
            tax: order.tax,
            total: order.total,
            method,
        })
    }
}

/// Produces an opaque fiscal signature for a receipt.
///
/// Implementations report failures as `PosError::FiscalSigning`; any other
/// error kind is wrapped into it by the session.
pub trait FiscalSigner: Send + Sync {
    fn sign(&self, receipt: &FiscalReceipt) -> PosResult<String>;
}

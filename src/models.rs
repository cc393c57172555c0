//! Domain types shared by the return and settlement modules.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Who is acting, and for which franchise. Passed explicitly into every
/// core operation; nothing reads the current user from ambient state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub franchise_id: String,
    pub actor_id: Option<String>,
}

impl RequestContext {
    pub fn new(franchise_id: impl Into<String>, actor_id: Option<String>) -> Self {
        Self {
            franchise_id: franchise_id.into(),
            actor_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    PendingPayment,
    Confirmed,
    Delivered,
    Returned,
    Settled,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingPayment => "pending_payment",
            Self::Confirmed => "confirmed",
            Self::Delivered => "delivered",
            Self::Returned => "returned",
            Self::Settled => "settled",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "pending_payment" => Some(Self::PendingPayment),
            "confirmed" => Some(Self::Confirmed),
            "delivered" => Some(Self::Delivered),
            "returned" => Some(Self::Returned),
            "settled" => Some(Self::Settled),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Return events may only be captured once goods are out.
    pub fn accepts_returns(self) -> bool {
        matches!(self, Self::Delivered | Self::Returned)
    }
}

/// Settlement finalizer state for one booking.
///
/// `Open -> Reconciling -> Finalized`, or `Reconciling -> Failed`.
/// `Failed` bookings are retried from `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementState {
    Open,
    Reconciling,
    Finalized,
    Failed,
}

impl SettlementState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Reconciling => "reconciling",
            Self::Finalized => "finalized",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "open" => Some(Self::Open),
            "reconciling" => Some(Self::Reconciling),
            "finalized" => Some(Self::Finalized),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finalized | Self::Failed)
    }
}

/// Booking variant. Only rentals carry a deposit and a date window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BookingKind {
    Rental {
        deposit_amount: Decimal,
        #[serde(default)]
        event_date: Option<NaiveDate>,
        #[serde(default)]
        delivery_date: Option<NaiveDate>,
        #[serde(default)]
        return_date: Option<NaiveDate>,
    },
    DirectSale,
}

impl BookingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rental { .. } => "rental",
            Self::DirectSale => "direct_sale",
        }
    }

    pub fn deposit(&self) -> Decimal {
        match self {
            Self::Rental { deposit_amount, .. } => *deposit_amount,
            Self::DirectSale => Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: String,
    pub franchise_id: String,
    pub booking_number: String,
    pub kind: BookingKind,
    pub status: BookingStatus,
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
    pub customer: Customer,
    pub settlement_locked: bool,
    pub settlement_state: SettlementState,
}

/// A booking line joined with the product's fee configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingItem {
    pub id: String,
    pub booking_id: String,
    pub product_id: String,
    pub product_name: String,
    pub quantity: u32,
    pub delivered_quantity: u32,
    pub unit_price: Decimal,
    pub total_price: Decimal,
    pub damage_fee: Option<Decimal>,
    pub lost_fee: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingSnapshot {
    pub booking: Booking,
    pub items: Vec<BookingItem>,
}

impl BookingSnapshot {
    pub fn item(&self, booking_item_id: &str) -> Option<&BookingItem> {
        self.items.iter().find(|i| i.id == booking_item_id)
    }
}

/// Caller-supplied return breakdown for one booking item.
///
/// Quantities are signed on the wire so negative values can be rejected
/// instead of failing deserialization with an opaque message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnLineInput {
    #[serde(alias = "booking_item_id")]
    pub booking_item_id: String,
    #[serde(
        default,
        alias = "quantity_delivered",
        alias = "qtyDelivered",
        alias = "qty_delivered"
    )]
    pub quantity_delivered: Option<i64>,
    #[serde(default, alias = "qty_fresh", alias = "qtyNotUsed")]
    pub fresh: i64,
    #[serde(default, alias = "qty_used", alias = "qtyReturned")]
    pub used: i64,
    #[serde(default, alias = "qty_damaged")]
    pub damaged: i64,
    #[serde(default, alias = "qty_lost")]
    pub lost: i64,
    #[serde(default, alias = "damage_reason")]
    pub damage_reason: Option<String>,
    #[serde(default, alias = "lost_reason")]
    pub lost_reason: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default, alias = "photo_url")]
    pub photo_url: Option<String>,
}

/// The four outcome buckets of a returned line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Buckets {
    pub fresh: u32,
    pub used: u32,
    pub damaged: u32,
    pub lost: u32,
}

impl Buckets {
    pub fn total(&self) -> u64 {
        u64::from(self.fresh) + u64::from(self.used) + u64::from(self.damaged) + u64::from(self.lost)
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn add(&self, other: &Buckets) -> Buckets {
        Buckets {
            fresh: self.fresh.saturating_add(other.fresh),
            used: self.used.saturating_add(other.used),
            damaged: self.damaged.saturating_add(other.damaged),
            lost: self.lost.saturating_add(other.lost),
        }
    }
}

/// A return line that passed conservation checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatedLine {
    pub booking_item_id: String,
    pub product_id: String,
    pub quantity_delivered: u32,
    pub buckets: Buckets,
    pub unit_price: Decimal,
    pub damage_reason: Option<String>,
    pub lost_reason: Option<String>,
    pub notes: Option<String>,
}

/// A stored return line, as captured by one return event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnOutcomeLine {
    pub id: String,
    pub return_event_id: String,
    pub booking_item_id: String,
    pub product_id: String,
    pub buckets: Buckets,
    pub damage_reason: Option<String>,
    pub lost_reason: Option<String>,
    pub notes: Option<String>,
    pub photo_url: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveReason {
    Damaged,
    Lost,
    Stolen,
    Discontinued,
}

impl ArchiveReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Damaged => "damaged",
            Self::Lost => "lost",
            Self::Stolen => "stolen",
            Self::Discontinued => "discontinued",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "damaged" => Some(Self::Damaged),
            "lost" => Some(Self::Lost),
            "stolen" => Some(Self::Stolen),
            "discontinued" => Some(Self::Discontinued),
            _ => None,
        }
    }

    /// Lost units are filed as stolen when the operator says so.
    pub fn for_lost(lost_reason: Option<&str>) -> Self {
        match lost_reason.map(|r| r.trim().to_ascii_lowercase()).as_deref() {
            Some("stolen") => Self::Stolen,
            _ => Self::Lost,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveEntry {
    pub id: String,
    pub franchise_id: String,
    pub product_id: String,
    pub booking_id: Option<String>,
    pub settlement_id: Option<String>,
    pub reason: ArchiveReason,
    pub quantity: u32,
    pub restored_quantity: u32,
    pub original_price: Decimal,
    pub notes: Option<String>,
    pub archived_by: Option<String>,
    pub archived_at: String,
}

impl ArchiveEntry {
    pub fn outstanding(&self) -> u32 {
        self.quantity.saturating_sub(self.restored_quantity)
    }
}

/// Per-product stock counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StockLevels {
    pub total_owned: u32,
    pub available: u32,
    pub booked: u32,
    pub in_laundry: u32,
    pub archived: u32,
}

impl StockLevels {
    /// `total_owned == available + booked + in_laundry + archived`.
    pub fn is_balanced(&self) -> bool {
        u64::from(self.total_owned)
            == u64::from(self.available)
                + u64::from(self.booked)
                + u64::from(self.in_laundry)
                + u64::from(self.archived)
    }
}

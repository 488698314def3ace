//! Canonical financial record model shared by every PPR crate.

use std::fmt;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// The independent record families pulled from the partner platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordCategory {
    DistributionPayouts,
    CreatorPayouts,
    Analytics,
}

impl RecordCategory {
    pub const ALL: [RecordCategory; 3] = [
        RecordCategory::DistributionPayouts,
        RecordCategory::CreatorPayouts,
        RecordCategory::Analytics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DistributionPayouts => "distribution_payouts",
            Self::CreatorPayouts => "creator_payouts",
            Self::Analytics => "analytics",
        }
    }
}

impl fmt::Display for RecordCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity + ordering contract used by the merge engine.
pub trait Keyed {
    /// Natural id when present, otherwise a composite built from the record's own fields.
    fn identity_key(&self) -> String;
    fn date(&self) -> NaiveDate;
}

/// Terminal status of a category's fetch chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    /// At least one strategy produced parseable records.
    Fetched,
    /// The source explicitly reported that zero records exist.
    ConfirmedEmpty,
    /// Every strategy failed or returned an ambiguous empty payload.
    NoData,
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_payout_type() -> String {
    "settlement".to_string()
}

fn fallback_key(date: NaiveDate, amount_paid: Decimal, extra: Option<&str>) -> String {
    match extra {
        Some(extra) => format!("fallback:{date}:{}:{extra}", amount_paid.normalize()),
        None => format!("fallback:{date}:{}", amount_paid.normalize()),
    }
}

/// Settlement statement paid out by the distribution (shop/affiliate) program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionPayoutRecord {
    pub statement_id: String,
    pub date: NaiveDate,
    #[serde(with = "rust_decimal::serde::float")]
    pub settlement_amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount_paid: Decimal,
    #[serde(rename = "type", default = "default_payout_type")]
    pub payout_type: String,
    #[serde(default = "default_currency")]
    pub currency: String,
}

impl Keyed for DistributionPayoutRecord {
    fn identity_key(&self) -> String {
        let id = self.statement_id.trim();
        if id.is_empty() {
            fallback_key(self.date, self.amount_paid, Some(&self.payout_type))
        } else {
            id.to_string()
        }
    }

    fn date(&self) -> NaiveDate {
        self.date
    }
}

/// Payment made to the creator account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatorPayoutRecord {
    pub payment_id: String,
    pub date: NaiveDate,
    #[serde(with = "rust_decimal::serde::float")]
    pub settlement_amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount_paid: Decimal,
}

impl Keyed for CreatorPayoutRecord {
    fn identity_key(&self) -> String {
        let id = self.payment_id.trim();
        if id.is_empty() {
            fallback_key(self.date, self.amount_paid, None)
        } else {
            id.to_string()
        }
    }

    fn date(&self) -> NaiveDate {
        self.date
    }
}

/// Metric values produced by one analytics fetch, before they are stamped into the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalyticsMetrics {
    pub affiliate_gmv: Decimal,
    pub est_commission: Decimal,
    pub orders: u64,
    pub gmv_refund: Decimal,
}

impl AnalyticsMetrics {
    /// Sum two metric segments (e.g. per-day rows of the same window).
    pub fn combine(&self, other: &AnalyticsMetrics) -> AnalyticsMetrics {
        AnalyticsMetrics {
            affiliate_gmv: self.affiliate_gmv + other.affiliate_gmv,
            est_commission: self.est_commission + other.est_commission,
            orders: self.orders.saturating_add(other.orders),
            gmv_refund: self.gmv_refund + other.gmv_refund,
        }
    }
}

/// Single mutable analytics record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSnapshot {
    /// Serialized as JSON `null` until the first successful analytics fetch, then `"YYYY-MM-DD"`.
    /// Readers of the state file must treat `null` as "never fetched", not as a parse error.
    #[serde(default)]
    pub last_updated: Option<NaiveDate>,
    #[serde(default, with = "rust_decimal::serde::float")]
    pub affiliate_gmv: Decimal,
    #[serde(default, with = "rust_decimal::serde::float")]
    pub est_commission: Decimal,
    #[serde(default)]
    pub orders: u64,
    #[serde(default, with = "rust_decimal::serde::float")]
    pub gmv_refund: Decimal,
}

impl AnalyticsSnapshot {
    /// Replace every metric field and advance `last_updated` to the run date.
    pub fn apply(&mut self, metrics: &AnalyticsMetrics, run_date: NaiveDate) {
        self.affiliate_gmv = metrics.affiliate_gmv;
        self.est_commission = metrics.est_commission;
        self.orders = metrics.orders;
        self.gmv_refund = metrics.gmv_refund;
        self.last_updated = Some(run_date);
    }
}

/// Durable root object written to the state file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub analytics: AnalyticsSnapshot,
    #[serde(default)]
    pub payouts: Vec<CreatorPayoutRecord>,
    #[serde(default)]
    pub distribution_payouts: Vec<DistributionPayoutRecord>,
}

impl PersistedState {
    pub fn is_empty(&self) -> bool {
        self.payouts.is_empty()
            && self.distribution_payouts.is_empty()
            && self.analytics.last_updated.is_none()
    }
}

//! Fetch strategy contracts, partner endpoint strategies, and the record normalizer.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use hmac::{Hmac, Mac};
use ppr_core::{
    AnalyticsMetrics, CreatorPayoutRecord, DistributionPayoutRecord, RecordCategory,
};
use ppr_storage::{FetchError, HttpFetcher, HttpRequest};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Codes the partner platform reserves for "unauthenticated" / "unauthorized".
pub const DEFAULT_AUTH_ERROR_CODES: &[i64] = &[401, 403];
pub const AUTH_MESSAGE_KEYWORDS: &[&str] = &["login", "auth", "session"];

/// Epoch values at or above this are milliseconds (year ~5138 in seconds).
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Signed open-API call using the app key / secret / access token triple.
    OpenApi,
    /// Internal JSON endpoint authenticated with the dashboard session cookie.
    SessionApi,
    /// HTML scrape of the rendered dashboard page.
    DashboardScrape,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenApi => "open_api",
            Self::SessionApi => "session_api",
            Self::DashboardScrape => "dashboard_scrape",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StrategyError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    #[error("authentication expired: {0}")]
    AuthExpired(String),
    #[error("empty response without a confirmed-zero signal")]
    EmptyUnconfirmed,
    #[error("strategy not configured: missing {0}")]
    NotConfigured(&'static str),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl StrategyError {
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::AuthExpired(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::TransientNetwork(_) => "transient_network",
            Self::AuthExpired(_) => "auth_expired",
            Self::EmptyUnconfirmed => "empty_unconfirmed",
            Self::NotConfigured(_) => "not_configured",
            Self::Malformed(_) => "malformed",
        }
    }
}

/// Auth-failure classifier: reserved numeric codes plus message keywords.
#[derive(Debug, Clone)]
pub struct AuthSignals {
    codes: BTreeSet<i64>,
}

impl Default for AuthSignals {
    fn default() -> Self {
        Self {
            codes: DEFAULT_AUTH_ERROR_CODES.iter().copied().collect(),
        }
    }
}

impl AuthSignals {
    pub fn with_extra_codes(codes: impl IntoIterator<Item = i64>) -> Self {
        let mut signals = Self::default();
        signals.codes.extend(codes);
        signals
    }

    pub fn codes(&self) -> impl Iterator<Item = i64> + '_ {
        self.codes.iter().copied()
    }

    pub fn is_auth_failure(&self, code: Option<i64>, message: &str) -> bool {
        if code.is_some_and(|c| self.codes.contains(&c)) {
            return true;
        }
        let lower = message.to_ascii_lowercase();
        AUTH_MESSAGE_KEYWORDS.iter().any(|kw| lower.contains(kw))
    }

    /// Failed responses are transient unless an auth signal matches.
    pub fn classify(&self, code: Option<i64>, message: &str) -> StrategyError {
        let detail = match code {
            Some(code) => format!("code {code}: {message}"),
            None => message.to_string(),
        };
        if self.is_auth_failure(code, message) {
            StrategyError::AuthExpired(detail)
        } else {
            StrategyError::TransientNetwork(detail)
        }
    }

    pub fn classify_fetch_error(&self, err: &FetchError) -> StrategyError {
        match err {
            FetchError::HttpStatus { status, url, body } => {
                let (body_code, message, login_form) = match serde_json::from_str::<JsonValue>(body) {
                    Ok(value) => (
                        envelope_code(&value, "code"),
                        envelope_message(&value, "message").unwrap_or_default(),
                        false,
                    ),
                    Err(_) => {
                        let page = read_non_json_body(body);
                        (None, page.message, page.login_form)
                    }
                };
                let detail = format!("http {status} from {url}: {message}");
                if login_form
                    || self.is_auth_failure(Some(i64::from(*status)), "")
                    || self.is_auth_failure(body_code, &message)
                {
                    StrategyError::AuthExpired(detail)
                } else {
                    StrategyError::TransientNetwork(detail)
                }
            }
            FetchError::Request(_) | FetchError::LimiterClosed => {
                StrategyError::TransientNetwork(err.to_string())
            }
        }
    }
}

#[derive(Clone)]
pub struct SignedCredentials {
    pub app_key: String,
    pub app_secret: String,
    pub access_token: String,
}

/// Raw credentials handed to the run; acquisition happens outside this crate.
#[derive(Clone, Default)]
pub struct Credentials {
    pub signed: Option<SignedCredentials>,
    pub session_cookie: Option<String>,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.signed.is_none() && self.session_cookie.is_none()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("signed", &self.signed.is_some())
            .field("session_cookie", &self.session_cookie.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SourceEndpoints {
    pub open_api_base_url: String,
    pub session_base_url: String,
}

impl Default for SourceEndpoints {
    fn default() -> Self {
        Self {
            open_api_base_url: "https://open-api.partner.example".to_string(),
            session_base_url: "https://partner.example".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PaginationLimits {
    pub max_pages: u32,
    pub page_size: u32,
}

impl Default for PaginationLimits {
    fn default() -> Self {
        Self {
            max_pages: 50,
            page_size: 50,
        }
    }
}

/// Everything a strategy needs for one run, passed explicitly to every fetch.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub credentials: Credentials,
    pub endpoints: SourceEndpoints,
    pub pagination: PaginationLimits,
    pub auth_signals: AuthSignals,
}

impl RunContext {
    pub fn new(run_date: NaiveDate) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            run_date,
            credentials: Credentials::default(),
            endpoints: SourceEndpoints::default(),
            pagination: PaginationLimits::default(),
            auth_signals: AuthSignals::default(),
        }
    }
}

/// Un-normalized records returned by one strategy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawBatch {
    pub records: Vec<JsonValue>,
    /// The source explicitly reported zero records (as opposed to an ambiguous empty body).
    pub confirmed_empty: bool,
}

#[async_trait]
pub trait FetchStrategy: Send + Sync {
    fn name(&self) -> &str;
    /// Selects the field-mapping table used to normalize this strategy's output.
    fn kind(&self) -> StrategyKind;

    async fn fetch(&self, ctx: &RunContext) -> Result<RawBatch, StrategyError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageCursor {
    pub page_number: u32,
    pub page_token: Option<String>,
    pub offset: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<JsonValue>,
    pub total_count: Option<usize>,
    pub next_page_token: Option<String>,
}

#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, ctx: &RunContext, cursor: &PageCursor) -> Result<Page, StrategyError>;
}

/// Sequentially pull pages while the source reports more, bounded by `max_pages`.
/// Any page failure fails the whole strategy.
pub async fn collect_pages(source: &dyn PageSource, ctx: &RunContext) -> Result<RawBatch, StrategyError> {
    let max_pages = ctx.pagination.max_pages.max(1);
    let mut records: Vec<JsonValue> = Vec::new();
    let mut reported_total: Option<usize> = None;
    let mut token_paged = false;
    let mut cursor = PageCursor {
        page_number: 1,
        page_token: None,
        offset: 0,
    };
    let mut pages = 0u32;

    loop {
        let page = source.fetch_page(ctx, &cursor).await?;
        pages += 1;

        let page_len = page.records.len();
        if page.total_count.is_some() {
            reported_total = page.total_count;
        }
        records.extend(page.records);

        let token = page.next_page_token.filter(|t| !t.trim().is_empty());
        token_paged |= token.is_some();
        let more = page_len > 0
            && match (reported_total, &token) {
                _ if token_paged && token.is_none() => false,
                (Some(total), _) => records.len() < total,
                (None, Some(_)) => true,
                (None, None) => false,
            };

        if !more {
            break;
        }
        if pages >= max_pages {
            warn!(
                run_id = %ctx.run_id,
                pages,
                accumulated = records.len(),
                reported_total = ?reported_total,
                "pagination ceiling reached; keeping accumulated records"
            );
            break;
        }

        cursor = PageCursor {
            page_number: cursor.page_number + 1,
            page_token: token,
            offset: records.len(),
        };
    }

    let confirmed_empty = records.is_empty() && reported_total == Some(0);
    Ok(RawBatch {
        records,
        confirmed_empty,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalField {
    Identity,
    Date,
    SettlementAmount,
    AmountPaid,
    PayoutType,
    Currency,
    AffiliateGmv,
    EstCommission,
    Orders,
    GmvRefund,
}

/// Ordered candidate source paths per canonical field, for one category/source version.
/// Dotted candidates descend into nested objects (`settlement_amount.value`).
#[derive(Debug)]
pub struct FieldMap {
    pub category: RecordCategory,
    pub kind: StrategyKind,
    pub fields: &'static [(CanonicalField, &'static [&'static str])],
}

impl FieldMap {
    pub fn candidates(&self, field: CanonicalField) -> &'static [&'static str] {
        self.fields
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, candidates)| *candidates)
            .unwrap_or(&[])
    }

    /// First present, non-null, non-blank candidate value.
    pub fn lookup<'a>(&self, raw: &'a JsonValue, field: CanonicalField) -> Option<&'a JsonValue> {
        self.candidates(field)
            .iter()
            .filter_map(|path| json_at(raw, path))
            .find(|value| match value {
                JsonValue::Null => false,
                JsonValue::String(s) => !s.trim().is_empty(),
                _ => true,
            })
    }
}

use CanonicalField as F;

static DISTRIBUTION_OPEN_API: FieldMap = FieldMap {
    category: RecordCategory::DistributionPayouts,
    kind: StrategyKind::OpenApi,
    fields: &[
        (F::Identity, &["id", "statement_id"]),
        (F::Date, &["statement_time", "payment_time", "create_time"]),
        (F::SettlementAmount, &["settlement_amount", "revenue_amount", "amount"]),
        (F::AmountPaid, &["payment_amount", "amount_paid", "paid_amount"]),
        (F::PayoutType, &["statement_type", "type"]),
        (F::Currency, &["currency", "settlement_currency"]),
    ],
};

static DISTRIBUTION_SESSION_API: FieldMap = FieldMap {
    category: RecordCategory::DistributionPayouts,
    kind: StrategyKind::SessionApi,
    fields: &[
        (F::Identity, &["statement_id", "settlement_id", "id"]),
        (F::Date, &["settle_time", "statement_date", "date", "create_time"]),
        (
            F::SettlementAmount,
            &[
                "settlement_amount.value",
                "revenue_amount.value",
                "settlement_amount",
                "revenue_amount",
                "amount",
            ],
        ),
        (
            F::AmountPaid,
            &["amount_paid.value", "paid_amount.value", "amount_paid", "paid_amount"],
        ),
        (F::PayoutType, &["type", "settlement_type"]),
        (F::Currency, &["settlement_amount.currency", "currency"]),
    ],
};

static DISTRIBUTION_DASHBOARD: FieldMap = FieldMap {
    category: RecordCategory::DistributionPayouts,
    kind: StrategyKind::DashboardScrape,
    fields: &[
        (F::Identity, &["statement_id", "statement", "id"]),
        (F::Date, &["statement_date", "settlement_date", "date"]),
        (F::SettlementAmount, &["settlement_amount", "revenue", "amount"]),
        (F::AmountPaid, &["amount_paid", "paid", "payout"]),
        (F::PayoutType, &["type"]),
        (F::Currency, &["currency"]),
    ],
};

static CREATOR_OPEN_API: FieldMap = FieldMap {
    category: RecordCategory::CreatorPayouts,
    kind: StrategyKind::OpenApi,
    fields: &[
        (F::Identity, &["id", "payment_id"]),
        (F::Date, &["paid_time", "payment_time", "create_time"]),
        (F::SettlementAmount, &["settlement_amount", "amount"]),
        (F::AmountPaid, &["payment_amount", "amount_paid", "amount"]),
    ],
};

static CREATOR_SESSION_API: FieldMap = FieldMap {
    category: RecordCategory::CreatorPayouts,
    kind: StrategyKind::SessionApi,
    fields: &[
        (F::Identity, &["payment_id", "withdrawal_id", "id"]),
        (F::Date, &["paid_time", "payment_date", "date", "create_time"]),
        (
            F::SettlementAmount,
            &["settlement_amount.value", "settlement_amount", "amount.value", "amount"],
        ),
        (
            F::AmountPaid,
            &[
                "amount_paid.value",
                "paid_amount.value",
                "amount_paid",
                "paid_amount",
                "amount.value",
                "amount",
            ],
        ),
    ],
};

static CREATOR_DASHBOARD: FieldMap = FieldMap {
    category: RecordCategory::CreatorPayouts,
    kind: StrategyKind::DashboardScrape,
    fields: &[
        (F::Identity, &["payment_id", "reference", "id"]),
        (F::Date, &["payment_date", "date"]),
        (F::SettlementAmount, &["settlement_amount", "amount"]),
        (F::AmountPaid, &["amount_paid", "paid", "amount"]),
    ],
};

static ANALYTICS_OPEN_API: FieldMap = FieldMap {
    category: RecordCategory::Analytics,
    kind: StrategyKind::OpenApi,
    fields: &[
        (F::AffiliateGmv, &["affiliate_gmv.amount", "affiliate_gmv", "gmv.amount", "gmv"]),
        (
            F::EstCommission,
            &["estimated_commission.amount", "estimated_commission", "est_commission"],
        ),
        (F::Orders, &["affiliate_orders", "orders", "order_count"]),
        (F::GmvRefund, &["gmv_refund.amount", "refund_gmv", "gmv_refund"]),
    ],
};

static ANALYTICS_SESSION_API: FieldMap = FieldMap {
    category: RecordCategory::Analytics,
    kind: StrategyKind::SessionApi,
    fields: &[
        (F::AffiliateGmv, &["affiliate_gmv.value", "affiliate_gmv", "gmv"]),
        (
            F::EstCommission,
            &["est_commission.value", "est_commission", "estimated_commission"],
        ),
        (F::Orders, &["orders", "order_cnt", "order_count"]),
        (F::GmvRefund, &["gmv_refund.value", "gmv_refund", "refund_amount"]),
    ],
};

static ANALYTICS_DASHBOARD: FieldMap = FieldMap {
    category: RecordCategory::Analytics,
    kind: StrategyKind::DashboardScrape,
    fields: &[
        (F::AffiliateGmv, &["affiliate_gmv", "gmv"]),
        (F::EstCommission, &["est_commission", "estimated_commission"]),
        (F::Orders, &["orders"]),
        (F::GmvRefund, &["gmv_refund", "refunds"]),
    ],
};

pub fn field_map(category: RecordCategory, kind: StrategyKind) -> &'static FieldMap {
    match (category, kind) {
        (RecordCategory::DistributionPayouts, StrategyKind::OpenApi) => &DISTRIBUTION_OPEN_API,
        (RecordCategory::DistributionPayouts, StrategyKind::SessionApi) => &DISTRIBUTION_SESSION_API,
        (RecordCategory::DistributionPayouts, StrategyKind::DashboardScrape) => &DISTRIBUTION_DASHBOARD,
        (RecordCategory::CreatorPayouts, StrategyKind::OpenApi) => &CREATOR_OPEN_API,
        (RecordCategory::CreatorPayouts, StrategyKind::SessionApi) => &CREATOR_SESSION_API,
        (RecordCategory::CreatorPayouts, StrategyKind::DashboardScrape) => &CREATOR_DASHBOARD,
        (RecordCategory::Analytics, StrategyKind::OpenApi) => &ANALYTICS_OPEN_API,
        (RecordCategory::Analytics, StrategyKind::SessionApi) => &ANALYTICS_SESSION_API,
        (RecordCategory::Analytics, StrategyKind::DashboardScrape) => &ANALYTICS_DASHBOARD,
    }
}

fn json_at<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        cur = cur.get(segment)?;
    }
    Some(cur)
}

fn json_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Numbers or numeric strings; currency symbols, separators and whitespace are ignored.
pub fn parse_amount(value: &JsonValue) -> Option<Decimal> {
    let text = match value {
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => s
            .chars()
            .filter(|c| c.is_ascii_digit() || matches!(c, '.' | '-'))
            .collect(),
        _ => return None,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

/// Epoch seconds, epoch milliseconds, or common date strings, truncated to the UTC day.
pub fn parse_date(value: &JsonValue) -> Option<NaiveDate> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(epoch_to_date),
        JsonValue::String(s) => {
            let s = s.trim();
            if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) {
                if s.len() == 8 {
                    if let Ok(day) = NaiveDate::parse_from_str(s, "%Y%m%d") {
                        return Some(day);
                    }
                }
                return s.parse::<i64>().ok().and_then(epoch_to_date);
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc).date_naive());
            }
            ["%Y-%m-%d", "%Y/%m/%d"]
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
                .or_else(|| {
                    s.get(..10)
                        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
                })
        }
        _ => None,
    }
}

fn epoch_to_date(epoch: i64) -> Option<NaiveDate> {
    if epoch <= 0 {
        return None;
    }
    let dt = if epoch >= EPOCH_MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(epoch)
    } else {
        DateTime::from_timestamp(epoch, 0)
    };
    dt.map(|dt| dt.date_naive())
}

pub fn parse_count(value: &JsonValue) -> Option<u64> {
    match value {
        JsonValue::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        JsonValue::String(s) => {
            let text: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || matches!(c, '.' | '-'))
                .collect();
            Decimal::from_str(&text).ok()?.trunc().to_u64()
        }
        _ => None,
    }
}

/// Present-but-unparseable and negative amounts both coerce to zero.
fn amount_or_zero(raw: &JsonValue, map: &FieldMap, field: CanonicalField) -> Decimal {
    let Some(value) = map.lookup(raw, field) else {
        return Decimal::ZERO;
    };
    match parse_amount(value) {
        Some(amount) if amount.is_sign_negative() => {
            debug!(?field, %amount, "negative amount clamped to zero");
            Decimal::ZERO
        }
        Some(amount) => amount,
        None => {
            debug!(?field, raw = %value, "unparseable amount coerced to zero");
            Decimal::ZERO
        }
    }
}

fn text_or(raw: &JsonValue, map: &FieldMap, field: CanonicalField, default: &str) -> String {
    map.lookup(raw, field)
        .and_then(json_text)
        .unwrap_or_else(|| default.to_string())
}

/// A canonical record type that can be built from one raw source object.
pub trait CanonicalRecord: Sized + Send + 'static {
    const CATEGORY: RecordCategory;

    /// `None` means the raw object lacks the minimum fields and is counted as unparseable.
    fn from_raw(raw: &JsonValue, map: &FieldMap) -> Option<Self>;
}

impl CanonicalRecord for DistributionPayoutRecord {
    const CATEGORY: RecordCategory = RecordCategory::DistributionPayouts;

    fn from_raw(raw: &JsonValue, map: &FieldMap) -> Option<Self> {
        let date = map.lookup(raw, F::Date).and_then(parse_date)?;
        Some(Self {
            statement_id: text_or(raw, map, F::Identity, ""),
            date,
            settlement_amount: amount_or_zero(raw, map, F::SettlementAmount),
            amount_paid: amount_or_zero(raw, map, F::AmountPaid),
            payout_type: text_or(raw, map, F::PayoutType, "settlement"),
            currency: text_or(raw, map, F::Currency, "USD").to_ascii_uppercase(),
        })
    }
}

impl CanonicalRecord for CreatorPayoutRecord {
    const CATEGORY: RecordCategory = RecordCategory::CreatorPayouts;

    fn from_raw(raw: &JsonValue, map: &FieldMap) -> Option<Self> {
        let date = map.lookup(raw, F::Date).and_then(parse_date)?;
        Some(Self {
            payment_id: text_or(raw, map, F::Identity, ""),
            date,
            settlement_amount: amount_or_zero(raw, map, F::SettlementAmount),
            amount_paid: amount_or_zero(raw, map, F::AmountPaid),
        })
    }
}

impl CanonicalRecord for AnalyticsMetrics {
    const CATEGORY: RecordCategory = RecordCategory::Analytics;

    fn from_raw(raw: &JsonValue, map: &FieldMap) -> Option<Self> {
        let metric_fields = [F::AffiliateGmv, F::EstCommission, F::Orders, F::GmvRefund];
        if metric_fields.iter().all(|f| map.lookup(raw, *f).is_none()) {
            return None;
        }
        Some(Self {
            affiliate_gmv: amount_or_zero(raw, map, F::AffiliateGmv),
            est_commission: amount_or_zero(raw, map, F::EstCommission),
            orders: map.lookup(raw, F::Orders).and_then(parse_count).unwrap_or(0),
            gmv_refund: amount_or_zero(raw, map, F::GmvRefund),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized<T> {
    pub records: Vec<T>,
    pub unparseable: usize,
}

impl<T> Default for Normalized<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            unparseable: 0,
        }
    }
}

pub fn normalize<T: CanonicalRecord>(raw: &[JsonValue], kind: StrategyKind) -> Normalized<T> {
    let map = field_map(T::CATEGORY, kind);
    let mut out = Normalized::default();
    for (idx, item) in raw.iter().enumerate() {
        match T::from_raw(item, map) {
            Some(record) => out.records.push(record),
            None => {
                out.unparseable += 1;
                debug!(category = %T::CATEGORY, %kind, idx, "dropping unparseable raw record");
            }
        }
    }
    out
}

/// One configured endpoint; the registry lists these per category in priority order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub kind: StrategyKind,
    pub path: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// Dotted path to the record array (or single object) in the JSON body.
    #[serde(default)]
    pub records_path: Option<String>,
    #[serde(default)]
    pub total_path: Option<String>,
    #[serde(default)]
    pub next_token_path: Option<String>,
    #[serde(default)]
    pub row_selector: Option<String>,
    /// Presence of this element on a scraped page is the source's confirmed-zero signal.
    #[serde(default)]
    pub empty_selector: Option<String>,
    /// Scrape single-value metric cards keyed by this attribute instead of a table.
    #[serde(default)]
    pub metric_attr: Option<String>,
}

impl EndpointSpec {
    fn api(kind: StrategyKind, path: &str, records_path: &str, total_path: &str) -> Self {
        Self {
            kind,
            path: path.to_string(),
            params: BTreeMap::new(),
            records_path: Some(records_path.to_string()),
            total_path: (!total_path.is_empty()).then(|| total_path.to_string()),
            next_token_path: None,
            row_selector: None,
            empty_selector: None,
            metric_attr: None,
        }
    }

    fn scrape(path: &str) -> Self {
        Self {
            kind: StrategyKind::DashboardScrape,
            path: path.to_string(),
            params: BTreeMap::new(),
            records_path: None,
            total_path: None,
            next_token_path: None,
            row_selector: Some("table tbody tr".to_string()),
            empty_selector: Some(".empty-state".to_string()),
            metric_attr: None,
        }
    }

    fn token_paged(mut self, next_token_path: &str) -> Self {
        self.next_token_path = Some(next_token_path.to_string());
        self
    }

    fn param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }
}

/// Ordered fetch strategies per category (the YAML registry shape).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyRegistry {
    #[serde(default)]
    pub distribution_payouts: Vec<EndpointSpec>,
    #[serde(default)]
    pub creator_payouts: Vec<EndpointSpec>,
    #[serde(default)]
    pub analytics: Vec<EndpointSpec>,
}

impl StrategyRegistry {
    pub fn builtin() -> Self {
        Self {
            distribution_payouts: vec![
                EndpointSpec::api(
                    StrategyKind::OpenApi,
                    "/finance/202309/statements",
                    "data.statements",
                    "data.total_count",
                )
                .token_paged("data.next_page_token")
                .param("sort_field", "statement_time")
                .param("sort_order", "DESC"),
                EndpointSpec::api(
                    StrategyKind::SessionApi,
                    "/api/v1/affiliate/settlement/statements",
                    "data.list",
                    "data.total",
                ),
                EndpointSpec::scrape("/finance/statements"),
            ],
            creator_payouts: vec![
                EndpointSpec::api(
                    StrategyKind::OpenApi,
                    "/finance/202309/payments",
                    "data.payments",
                    "data.total_count",
                )
                .token_paged("data.next_page_token")
                .param("sort_field", "create_time"),
                EndpointSpec::api(
                    StrategyKind::SessionApi,
                    "/api/v1/creator/payouts",
                    "data.list",
                    "data.total",
                ),
                EndpointSpec::scrape("/creator/payouts"),
            ],
            analytics: vec![
                EndpointSpec::api(
                    StrategyKind::OpenApi,
                    "/affiliate_creator/202405/performance/overview",
                    "data.performance",
                    "",
                ),
                EndpointSpec::api(
                    StrategyKind::SessionApi,
                    "/api/v1/affiliate/data/overview",
                    "data.stats",
                    "",
                ),
                EndpointSpec {
                    metric_attr: Some("data-metric".to_string()),
                    row_selector: None,
                    empty_selector: None,
                    ..EndpointSpec::scrape("/data/overview")
                },
            ],
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing strategy registry yaml")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn endpoints(&self, category: RecordCategory) -> &[EndpointSpec] {
        match category {
            RecordCategory::DistributionPayouts => &self.distribution_payouts,
            RecordCategory::CreatorPayouts => &self.creator_payouts,
            RecordCategory::Analytics => &self.analytics,
        }
    }
}

fn envelope_code(value: &JsonValue, path: &str) -> Option<i64> {
    let code = json_at(value, path)?;
    code.as_i64()
        .or_else(|| code.as_str().and_then(|s| s.trim().parse().ok()))
}

fn envelope_message(value: &JsonValue, path: &str) -> Option<String> {
    [path, "msg", "error"]
        .iter()
        .filter_map(|p| json_at(value, p))
        .find_map(json_text)
}

/// The parts of a non-JSON body that can carry an auth signal. Markup such as nav links,
/// meta tags and script names is never searched.
struct NonJsonBody {
    /// Trimmed text for plain bodies, the `<title>` for HTML pages.
    message: String,
    login_form: bool,
}

fn read_non_json_body(text: &str) -> NonJsonBody {
    let trimmed = text.trim();
    if !trimmed.starts_with('<') {
        return NonJsonBody {
            message: trimmed.chars().take(512).collect(),
            login_form: false,
        };
    }
    let document = Html::parse_document(trimmed);
    let title = Selector::parse("title")
        .ok()
        .and_then(|sel| document.select(&sel).next().map(element_text))
        .unwrap_or_default();
    let login_form = Selector::parse("input[type=password]")
        .ok()
        .is_some_and(|sel| document.select(&sel).next().is_some());
    NonJsonBody {
        message: title,
        login_form,
    }
}

/// Interpret one JSON API page: envelope error check, record extraction, paging hints.
pub fn interpret_api_page(
    body: &[u8],
    endpoint: &EndpointSpec,
    signals: &AuthSignals,
) -> Result<Page, StrategyError> {
    let value: JsonValue = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(err) => {
            // Expired sessions commonly answer 200 with the HTML login page.
            let page = read_non_json_body(&String::from_utf8_lossy(body));
            return if page.login_form || signals.is_auth_failure(None, &page.message) {
                Err(StrategyError::AuthExpired(format!(
                    "non-JSON body that looks like a login page: {}",
                    page.message
                )))
            } else {
                Err(StrategyError::Malformed(format!("invalid JSON body: {err}")))
            };
        }
    };

    if let Some(code) = envelope_code(&value, "code").filter(|c| *c != 0) {
        let message = envelope_message(&value, "message").unwrap_or_default();
        return Err(signals.classify(Some(code), &message));
    }

    let records_value = match endpoint.records_path.as_deref() {
        Some(path) => json_at(&value, path),
        None => Some(&value),
    };
    let records = match records_value {
        Some(JsonValue::Array(items)) => items.clone(),
        Some(obj @ JsonValue::Object(_)) => vec![obj.clone()],
        _ => Vec::new(),
    };

    let total_count = endpoint
        .total_path
        .as_deref()
        .and_then(|path| json_at(&value, path))
        .and_then(parse_count)
        .map(|n| n as usize);
    let next_page_token = endpoint
        .next_token_path
        .as_deref()
        .and_then(|path| json_at(&value, path))
        .and_then(json_text);

    Ok(Page {
        records,
        total_count,
        next_page_token,
    })
}

/// Lowercase hex HMAC-SHA256 over `secret + path + sorted(key + value) + secret`.
pub fn sign_open_api(
    app_secret: &str,
    path: &str,
    params: &BTreeMap<String, String>,
) -> Result<String, StrategyError> {
    let mut payload = String::with_capacity(app_secret.len() * 2 + path.len() + 64);
    payload.push_str(app_secret);
    payload.push_str(path);
    for (key, value) in params {
        if key == "sign" || key == "access_token" {
            continue;
        }
        payload.push_str(key);
        payload.push_str(value);
    }
    payload.push_str(app_secret);

    let mut mac = HmacSha256::new_from_slice(app_secret.as_bytes())
        .map_err(|e| StrategyError::Malformed(format!("signing key rejected: {e}")))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// JSON endpoint strategy: the signed open API or the session-authenticated internal API.
pub struct ApiStrategy {
    name: String,
    endpoint: EndpointSpec,
    http: Arc<HttpFetcher>,
}

impl ApiStrategy {
    pub fn new(category: RecordCategory, endpoint: EndpointSpec, http: Arc<HttpFetcher>) -> Self {
        Self {
            name: format!("{category}/{}:{}", endpoint.kind, endpoint.path),
            endpoint,
            http,
        }
    }

    fn build_request(&self, ctx: &RunContext, cursor: &PageCursor) -> Result<HttpRequest, StrategyError> {
        let page_size = ctx.pagination.page_size.max(1).to_string();
        match self.endpoint.kind {
            StrategyKind::OpenApi => {
                let creds = ctx
                    .credentials
                    .signed
                    .as_ref()
                    .ok_or(StrategyError::NotConfigured("signed api credentials"))?;
                let mut params = self.endpoint.params.clone();
                params.insert("app_key".to_string(), creds.app_key.clone());
                params.insert("timestamp".to_string(), Utc::now().timestamp().to_string());
                params.insert("page_size".to_string(), page_size);
                if let Some(token) = &cursor.page_token {
                    params.insert("page_token".to_string(), token.clone());
                }
                let sign = sign_open_api(&creds.app_secret, &self.endpoint.path, &params)?;

                let mut request = HttpRequest::get(join_url(
                    &ctx.endpoints.open_api_base_url,
                    &self.endpoint.path,
                ))
                .header("x-access-token", creds.access_token.clone());
                for (key, value) in params {
                    request = request.query(key, value);
                }
                Ok(request.query("sign", sign))
            }
            StrategyKind::SessionApi => {
                let cookie = ctx
                    .credentials
                    .session_cookie
                    .as_ref()
                    .ok_or(StrategyError::NotConfigured("session cookie"))?;
                let mut request = HttpRequest::get(join_url(
                    &ctx.endpoints.session_base_url,
                    &self.endpoint.path,
                ))
                .header("cookie", cookie.clone())
                .header("accept", "application/json");
                for (key, value) in &self.endpoint.params {
                    request = request.query(key.clone(), value.clone());
                }
                Ok(request
                    .query("page", cursor.page_number.to_string())
                    .query("page_size", page_size))
            }
            StrategyKind::DashboardScrape => Err(StrategyError::Malformed(
                "dashboard endpoints are handled by DashboardScrapeStrategy".to_string(),
            )),
        }
    }
}

#[async_trait]
impl PageSource for ApiStrategy {
    async fn fetch_page(&self, ctx: &RunContext, cursor: &PageCursor) -> Result<Page, StrategyError> {
        let request = self.build_request(ctx, cursor)?;
        let response = self
            .http
            .send(ctx.run_id, &self.name, request)
            .await
            .map_err(|err| ctx.auth_signals.classify_fetch_error(&err))?;
        interpret_api_page(&response.body, &self.endpoint, &ctx.auth_signals)
    }
}

#[async_trait]
impl FetchStrategy for ApiStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StrategyKind {
        self.endpoint.kind
    }

    async fn fetch(&self, ctx: &RunContext) -> Result<RawBatch, StrategyError> {
        collect_pages(self, ctx).await
    }
}

/// Rows (or metric cards) lifted out of a rendered dashboard page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DashboardPage {
    pub records: Vec<JsonValue>,
    pub empty_marker: bool,
    pub login_form: bool,
}

fn normalize_header(text: &str) -> String {
    text.to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

fn element_text(node: scraper::ElementRef<'_>) -> String {
    node.text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_selector(selector: &str) -> Result<Selector, StrategyError> {
    Selector::parse(selector)
        .map_err(|e| StrategyError::Malformed(format!("bad selector {selector:?}: {e}")))
}

pub fn parse_dashboard_page(html: &str, endpoint: &EndpointSpec) -> Result<DashboardPage, StrategyError> {
    let document = Html::parse_document(html);
    let mut page = DashboardPage {
        login_form: document
            .select(&parse_selector("input[type=password]")?)
            .next()
            .is_some(),
        ..DashboardPage::default()
    };

    if let Some(empty) = &endpoint.empty_selector {
        page.empty_marker = document.select(&parse_selector(empty)?).next().is_some();
    }

    if let Some(attr) = &endpoint.metric_attr {
        let mut metrics = JsonMap::new();
        for node in document.select(&parse_selector(&format!("[{attr}]"))?) {
            if let Some(key) = node.value().attr(attr) {
                metrics.insert(normalize_header(key), JsonValue::String(element_text(node)));
            }
        }
        if !metrics.is_empty() {
            page.records.push(JsonValue::Object(metrics));
        }
        return Ok(page);
    }

    let header_sel = parse_selector("thead th")?;
    let headers: Vec<String> = document
        .select(&header_sel)
        .map(|th| normalize_header(&element_text(th)))
        .collect();
    let row_sel = parse_selector(endpoint.row_selector.as_deref().unwrap_or("table tbody tr"))?;
    let cell_sel = parse_selector("td")?;

    for row in document.select(&row_sel) {
        let mut record = JsonMap::new();
        for (idx, cell) in row.select(&cell_sel).enumerate() {
            let Some(key) = headers.get(idx).filter(|h| !h.is_empty()) else {
                continue;
            };
            record.insert(key.clone(), JsonValue::String(element_text(cell)));
        }
        if !record.is_empty() {
            page.records.push(JsonValue::Object(record));
        }
    }
    Ok(page)
}

/// Scrape of the rendered dashboard, authenticated with the session cookie.
pub struct DashboardScrapeStrategy {
    name: String,
    endpoint: EndpointSpec,
    http: Arc<HttpFetcher>,
}

impl DashboardScrapeStrategy {
    pub fn new(category: RecordCategory, endpoint: EndpointSpec, http: Arc<HttpFetcher>) -> Self {
        Self {
            name: format!("{category}/{}:{}", endpoint.kind, endpoint.path),
            endpoint,
            http,
        }
    }
}

#[async_trait]
impl FetchStrategy for DashboardScrapeStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::DashboardScrape
    }

    async fn fetch(&self, ctx: &RunContext) -> Result<RawBatch, StrategyError> {
        let cookie = ctx
            .credentials
            .session_cookie
            .as_ref()
            .ok_or(StrategyError::NotConfigured("session cookie"))?;
        let mut request = HttpRequest::get(join_url(&ctx.endpoints.session_base_url, &self.endpoint.path))
            .header("cookie", cookie.clone())
            .header("accept", "text/html");
        for (key, value) in &self.endpoint.params {
            request = request.query(key.clone(), value.clone());
        }

        let response = self
            .http
            .send(ctx.run_id, &self.name, request)
            .await
            .map_err(|err| ctx.auth_signals.classify_fetch_error(&err))?;

        if response.final_url.to_ascii_lowercase().contains("login") {
            return Err(StrategyError::AuthExpired(format!(
                "dashboard redirected to {}",
                response.final_url
            )));
        }

        let page = parse_dashboard_page(&response.text(), &self.endpoint)?;
        if page.login_form {
            return Err(StrategyError::AuthExpired(
                "dashboard served a login form".to_string(),
            ));
        }
        Ok(RawBatch {
            confirmed_empty: page.records.is_empty() && page.empty_marker,
            records: page.records,
        })
    }
}

/// Instantiate the configured strategies for one category, in registry order.
pub fn build_strategies(
    registry: &StrategyRegistry,
    category: RecordCategory,
    http: &Arc<HttpFetcher>,
) -> Vec<Arc<dyn FetchStrategy>> {
    registry
        .endpoints(category)
        .iter()
        .cloned()
        .map(|endpoint| -> Arc<dyn FetchStrategy> {
            match endpoint.kind {
                StrategyKind::OpenApi | StrategyKind::SessionApi => {
                    Arc::new(ApiStrategy::new(category, endpoint, Arc::clone(http)))
                }
                StrategyKind::DashboardScrape => {
                    Arc::new(DashboardScrapeStrategy::new(category, endpoint, Arc::clone(http)))
                }
            }
        })
        .collect()
}

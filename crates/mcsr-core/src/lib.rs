//! Core domain model for MCSR: canonical sale records, staff attribution,
//! dedup keys, checkpoints, and ingestion reports.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mcsr-core";

/// Fee substituted for an exact-zero shipping value at read time.
/// The stored value stays zero so the rule can change without a backfill.
pub const MINIMUM_SHIPPING_FEE: f64 = 5.0;

/// Cap on failed-row identifiers sampled into an ingestion report.
pub const FAILED_SAMPLE_LIMIT: usize = 10;

/// Which sales stream a report belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Online,
    Pos,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Online => "online",
            SourceKind::Pos => "pos",
        }
    }
}

/// Wire format of an incoming report blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatHint {
    Delimited,
    Workbook,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MarketingFlags {
    pub email: Option<bool>,
    pub sms: Option<bool>,
    pub whatsapp: Option<bool>,
}

/// How a staff identity was resolved for a row. The order of the variants
/// mirrors resolution precedence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "strategy")]
pub enum StaffStrategy {
    FromColumn,
    FromClientMap,
    FromTag { id: String, known: bool },
}

/// Resolved staff identity attached to a sale record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffRef {
    pub display_name: String,
    pub strategy: StaffStrategy,
}

impl StaffRef {
    pub fn from_column(name: impl Into<String>) -> Self {
        Self {
            display_name: name.into(),
            strategy: StaffStrategy::FromColumn,
        }
    }

    pub fn from_client_map(name: impl Into<String>) -> Self {
        Self {
            display_name: name.into(),
            strategy: StaffStrategy::FromClientMap,
        }
    }

    pub fn from_directory(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            display_name: name.into(),
            strategy: StaffStrategy::FromTag {
                id: id.into(),
                known: true,
            },
        }
    }

    /// Placeholder for a tag identifier missing from the directory. The
    /// identifier is preserved rather than dropped.
    pub fn unknown(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: format!("Unknown Staff {id}"),
            strategy: StaffStrategy::FromTag { id, known: false },
        }
    }
}

/// Directory entry served by the store's admin-owned staff directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffMember {
    pub id: String,
    pub name: String,
}

/// Canonical sales line all sources converge to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleRecord {
    pub id: Uuid,
    pub source_channel: SourceKind,
    pub order_date: NaiveDate,
    pub actual_order_date: Option<NaiveDate>,
    pub order_reference: Option<String>,
    pub sales_channel_label: Option<String>,
    pub payment_gateway: Option<String>,
    pub net_amount: f64,
    pub total_amount: Option<f64>,
    pub shipping_amount: Option<f64>,
    pub staff: Option<StaffRef>,
    pub customer_email: Option<String>,
    pub marketing: MarketingFlags,
    pub ingested_at: DateTime<Utc>,
}

impl SaleRecord {
    /// Heuristic dedup identity derived from business fields. Not a
    /// guaranteed-unique transaction id; the gate treats it as a backstop.
    pub fn natural_key(&self) -> NaturalKey {
        let cents = (self.net_amount * 100.0).round() as i64;
        match &self.order_reference {
            Some(reference) => NaturalKey(format!(
                "{}:{}:{}:{}",
                self.source_channel.as_str(),
                reference.trim().to_ascii_lowercase(),
                self.order_date,
                cents
            )),
            None => NaturalKey(format!(
                "{}:-:{}:{}",
                self.source_channel.as_str(),
                self.order_date,
                cents
            )),
        }
    }

    /// Shipping as displayed: an exact-zero stored value reads as the
    /// minimum fee when the order total is non-zero.
    pub fn effective_shipping(&self) -> Option<f64> {
        match self.shipping_amount {
            Some(shipping) if shipping == 0.0 && self.total_amount.unwrap_or(0.0) != 0.0 => {
                Some(MINIMUM_SHIPPING_FEE)
            }
            other => other,
        }
    }

    /// Fill this record's null fields from a later snapshot of the same
    /// transaction. Populated fields are never overwritten.
    pub fn fill_missing_from(&mut self, other: &SaleRecord) {
        if self.actual_order_date.is_none() {
            self.actual_order_date = other.actual_order_date;
        }
        if self.sales_channel_label.is_none() {
            self.sales_channel_label = other.sales_channel_label.clone();
        }
        if self.payment_gateway.is_none() {
            self.payment_gateway = other.payment_gateway.clone();
        }
        if self.total_amount.is_none() {
            self.total_amount = other.total_amount;
        }
        if self.shipping_amount.is_none() {
            self.shipping_amount = other.shipping_amount;
        }
        if self.staff.is_none() {
            self.staff = other.staff.clone();
        }
        if self.customer_email.is_none() {
            self.customer_email = other.customer_email.clone();
        }
        if self.marketing.email.is_none() {
            self.marketing.email = other.marketing.email;
        }
        if self.marketing.sms.is_none() {
            self.marketing.sms = other.marketing.sms;
        }
        if self.marketing.whatsapp.is_none() {
            self.marketing.whatsapp = other.marketing.whatsapp;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NaturalKey(String);

impl NaturalKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Write semantics chosen by the caller, never inferred. Manual uploads are
/// strict so operator-driven imports stay auditable; polling sources upsert
/// because later snapshots carry richer columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    Strict,
    Upsert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Merged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    SkippedDuplicate,
    Merged,
}

/// Why a row was excluded without being treated as a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum SkipReason {
    /// No transactional signal in any resolved cell.
    Empty,
    /// "Grand Total"/"Total" footer emitted by the report generator.
    Summary,
    /// Bad or missing amount, or an otherwise unusable row.
    Invalid { detail: String },
    /// POS-labeled row submitted under the online stream.
    CrossChannel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
}

/// Last successfully processed position for one polling source + file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCheckpoint {
    pub last_processed_mod_time: Option<DateTime<Utc>>,
    pub last_run_at: DateTime<Utc>,
    pub last_run_outcome: RunOutcome,
}

/// Column-detection diagnostics for one canonical field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDetection {
    pub field: String,
    pub header: Option<String>,
    pub index: Option<usize>,
    pub matcher: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StaffAttribution {
    pub from_column: usize,
    pub from_client_map: usize,
    pub from_tag_known: usize,
    pub from_tag_unknown: usize,
    pub unresolved: usize,
}

impl StaffAttribution {
    pub fn record(&mut self, staff: Option<&StaffRef>) {
        match staff.map(|s| &s.strategy) {
            Some(StaffStrategy::FromColumn) => self.from_column += 1,
            Some(StaffStrategy::FromClientMap) => self.from_client_map += 1,
            Some(StaffStrategy::FromTag { known: true, .. }) => self.from_tag_known += 1,
            Some(StaffStrategy::FromTag { known: false, .. }) => self.from_tag_unknown += 1,
            None => self.unresolved += 1,
        }
    }
}

/// Per-invocation outcome summary. Returned and logged, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionReport {
    pub success: bool,
    pub source: SourceKind,
    pub mode: WriteMode,
    pub total_rows: usize,
    pub imported: usize,
    pub merged: usize,
    pub skipped_duplicate: usize,
    pub skipped_invalid: usize,
    pub skipped_empty: usize,
    pub failed: usize,
    pub imported_net_total: f64,
    pub failed_orders: Vec<String>,
    pub columns_detected: Vec<ColumnDetection>,
    pub staff_attribution: StaffAttribution,
    pub row_count_warning: Option<String>,
}

impl IngestionReport {
    pub fn new(source: SourceKind, mode: WriteMode) -> Self {
        Self {
            success: true,
            source,
            mode,
            total_rows: 0,
            imported: 0,
            merged: 0,
            skipped_duplicate: 0,
            skipped_invalid: 0,
            skipped_empty: 0,
            failed: 0,
            imported_net_total: 0.0,
            failed_orders: Vec::new(),
            columns_detected: Vec::new(),
            staff_attribution: StaffAttribution::default(),
            row_count_warning: None,
        }
    }

    pub fn record_skip(&mut self, reason: &SkipReason) {
        match reason {
            SkipReason::Empty | SkipReason::Summary => self.skipped_empty += 1,
            SkipReason::Invalid { .. } | SkipReason::CrossChannel => self.skipped_invalid += 1,
        }
    }

    pub fn record_write(&mut self, outcome: WriteOutcome, net_amount: f64) {
        match outcome {
            WriteOutcome::Inserted => {
                self.imported += 1;
                self.imported_net_total += net_amount;
            }
            WriteOutcome::SkippedDuplicate => self.skipped_duplicate += 1,
            WriteOutcome::Merged => self.merged += 1,
        }
    }

    /// Row-level write failure: counted, sampled, batch continues.
    pub fn record_failure(&mut self, row_identifier: String) {
        self.failed += 1;
        if self.failed_orders.len() < FAILED_SAMPLE_LIMIT {
            self.failed_orders.push(row_identifier);
        }
    }
}

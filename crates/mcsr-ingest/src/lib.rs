//! Report parsing and row normalization: tabular parsing for both wire
//! formats, heuristic column resolution over drifting headers, canonical
//! record normalization, and staff attribution.

use std::collections::HashMap;
use std::io::Cursor;

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::NaiveDate;
use mcsr_core::{
    ColumnDetection, FormatHint, MarketingFlags, SaleRecord, SkipReason, SourceKind, StaffRef,
};
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "mcsr-ingest";

/// One parsed report: headers plus ordered rows, the same shape for both
/// input formats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unreadable delimited text: {0}")]
    Delimited(#[from] csv::Error),
    #[error("unreadable workbook: {0}")]
    Workbook(#[from] calamine::Error),
    #[error("workbook has no sheets")]
    NoSheets,
    #[error("report contains no header row")]
    MissingHeader,
}

/// Parse a raw report blob. Workbooks read only the first sheet so one
/// downstream path serves both formats. Failure is fatal for this file only.
pub fn parse(raw: &[u8], format: FormatHint) -> Result<Table, ParseError> {
    match format {
        FormatHint::Delimited => parse_delimited(raw),
        FormatHint::Workbook => parse_workbook(raw),
    }
}

fn parse_delimited(raw: &[u8]) -> Result<Table, ParseError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(raw);

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    if headers.iter().all(|h| h.is_empty()) {
        return Err(ParseError::MissingHeader);
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(|c| c.trim().to_string()).collect());
    }
    Ok(Table { headers, rows })
}

fn parse_workbook(raw: &[u8]) -> Result<Table, ParseError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(raw.to_vec()))?;
    let sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or(ParseError::NoSheets)?;
    let range = workbook.worksheet_range(&sheet)?;
    table_from_range(&range)
}

fn table_from_range(range: &calamine::Range<Data>) -> Result<Table, ParseError> {
    let mut iter = range
        .rows()
        .skip_while(|row| row.iter().all(|c| matches!(c, Data::Empty)));
    let headers: Vec<String> = iter
        .next()
        .ok_or(ParseError::MissingHeader)?
        .iter()
        .map(cell_to_string)
        .collect();

    let rows = iter
        .map(|row| row.iter().map(cell_to_string).collect())
        .collect();
    Ok(Table { headers, rows })
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Int(i) => i.to_string(),
        // Integral floats render without the trailing ".0" so references and
        // amounts survive the cell coercion.
        Data::Float(f) if f.fract() == 0.0 => (*f as i64).to_string(),
        Data::Float(f) => f.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|d| d.date().to_string())
            .unwrap_or_else(|| dt.to_string()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Error(e) => format!("{e:?}"),
    }
}

/// Canonical business fields resolvable from a report's header row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanonicalField {
    OrderDate,
    ActualOrderDate,
    OrderReference,
    SalesChannel,
    PaymentGateway,
    NetAmount,
    TotalAmount,
    ShippingAmount,
    StaffName,
    StaffTag,
    CustomerEmail,
    MarketingEmail,
    MarketingSms,
    MarketingWhatsapp,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 14] = [
        CanonicalField::OrderDate,
        CanonicalField::ActualOrderDate,
        CanonicalField::OrderReference,
        CanonicalField::SalesChannel,
        CanonicalField::PaymentGateway,
        CanonicalField::NetAmount,
        CanonicalField::TotalAmount,
        CanonicalField::ShippingAmount,
        CanonicalField::StaffName,
        CanonicalField::StaffTag,
        CanonicalField::CustomerEmail,
        CanonicalField::MarketingEmail,
        CanonicalField::MarketingSms,
        CanonicalField::MarketingWhatsapp,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CanonicalField::OrderDate => "order_date",
            CanonicalField::ActualOrderDate => "actual_order_date",
            CanonicalField::OrderReference => "order_reference",
            CanonicalField::SalesChannel => "sales_channel",
            CanonicalField::PaymentGateway => "payment_gateway",
            CanonicalField::NetAmount => "net_amount",
            CanonicalField::TotalAmount => "total_amount",
            CanonicalField::ShippingAmount => "shipping_amount",
            CanonicalField::StaffName => "staff_name",
            CanonicalField::StaffTag => "staff_tag",
            CanonicalField::CustomerEmail => "customer_email",
            CanonicalField::MarketingEmail => "marketing_email",
            CanonicalField::MarketingSms => "marketing_sms",
            CanonicalField::MarketingWhatsapp => "marketing_whatsapp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Matcher {
    Exact(&'static str),
    Substring(&'static str),
    Fuzzy(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherKind {
    Exact,
    Substring,
    Fuzzy,
}

impl MatcherKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatcherKind::Exact => "exact",
            MatcherKind::Substring => "substring",
            MatcherKind::Fuzzy => "fuzzy",
        }
    }
}

const FUZZY_THRESHOLD: f64 = 0.93;

/// Ranked matchers per field, most specific first. Resolution is
/// source-kind-directional: POS reports carry a constant, uninformative
/// sales-channel column, so "channel" prefers the location name there.
fn matchers_for(field: CanonicalField, kind: SourceKind) -> &'static [Matcher] {
    use Matcher::{Exact, Fuzzy, Substring};
    match (field, kind) {
        (CanonicalField::OrderDate, _) => &[
            Exact("day"),
            Exact("date"),
            Exact("orderdate"),
            Exact("createdat"),
            Substring("date"),
        ],
        (CanonicalField::ActualOrderDate, _) => &[Exact("actualorderdate"), Substring("actual")],
        (CanonicalField::OrderReference, _) => &[
            Exact("name"),
            Exact("order"),
            Exact("ordername"),
            Exact("orderid"),
            Substring("reference"),
            Substring("ordernumber"),
        ],
        (CanonicalField::SalesChannel, SourceKind::Pos) => &[
            Exact("locationname"),
            Substring("location"),
            Exact("saleschannel"),
            Substring("channel"),
        ],
        (CanonicalField::SalesChannel, SourceKind::Online) => &[
            Exact("saleschannel"),
            Substring("channel"),
            Fuzzy("saleschannel"),
        ],
        (CanonicalField::PaymentGateway, _) => &[
            Exact("paymentgateway"),
            Substring("gateway"),
            Substring("paymentmethod"),
        ],
        // The excluding-gift-card variant outranks generic net sales in
        // every vintage that carries both.
        (CanonicalField::NetAmount, _) => &[
            Exact("netsalesexcludinggiftcard"),
            Substring("excludinggiftcard"),
            Exact("netsales"),
            Exact("netamount"),
            Substring("netsales"),
            Fuzzy("netsales"),
        ],
        (CanonicalField::TotalAmount, _) => &[
            Exact("totalsales"),
            Exact("total"),
            Substring("totalsales"),
            Fuzzy("totalsales"),
        ],
        (CanonicalField::ShippingAmount, _) => &[Exact("shipping"), Substring("shipping")],
        (CanonicalField::StaffName, _) => &[
            Exact("staffname"),
            Exact("posstaffmember"),
            Substring("staff"),
        ],
        (CanonicalField::StaffTag, _) => &[Exact("tags"), Substring("tag")],
        (CanonicalField::CustomerEmail, _) => {
            &[Exact("customeremail"), Exact("email"), Substring("email")]
        }
        (CanonicalField::MarketingEmail, _) => &[
            Exact("acceptsemailmarketing"),
            Substring("emailmarketing"),
        ],
        (CanonicalField::MarketingSms, _) => {
            &[Exact("acceptssmsmarketing"), Substring("smsmarketing")]
        }
        (CanonicalField::MarketingWhatsapp, _) => &[Substring("whatsapp")],
    }
}

/// Lowercase and strip everything non-alphanumeric, so "Net sales
/// (excluding gift card)" and "net_sales_excluding_gift_card" compare equal.
pub fn normalize_header(header: &str) -> String {
    header
        .to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub field: CanonicalField,
    pub header: Option<String>,
    pub index: Option<usize>,
    pub matcher: Option<MatcherKind>,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("required column not found: {0}")]
    MissingRequired(&'static str),
}

/// Canonical field → column index mapping plus per-field diagnostics.
#[derive(Debug, Clone)]
pub struct ColumnMap {
    indices: HashMap<CanonicalField, usize>,
    pub detections: Vec<Detection>,
}

impl ColumnMap {
    pub fn index(&self, field: CanonicalField) -> Option<usize> {
        self.indices.get(&field).copied()
    }

    /// Trimmed, non-empty cell for a resolved field.
    pub fn cell<'a>(&self, row: &'a [String], field: CanonicalField) -> Option<&'a str> {
        let cell = row.get(self.index(field)?)?.trim();
        if cell.is_empty() {
            None
        } else {
            Some(cell)
        }
    }

    pub fn detections_for_report(&self) -> Vec<ColumnDetection> {
        self.detections
            .iter()
            .map(|d| ColumnDetection {
                field: d.field.name().to_string(),
                header: d.header.clone(),
                index: d.index,
                matcher: d.matcher.map(|m| m.as_str().to_string()),
            })
            .collect()
    }
}

/// Resolve canonical fields against a header row. Only the net amount is
/// required; every other unresolved field degrades to null and is recorded
/// in the diagnostics.
pub fn resolve_columns(headers: &[String], kind: SourceKind) -> Result<ColumnMap, ResolveError> {
    let normalized: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();

    let mut indices = HashMap::new();
    let mut detections = Vec::with_capacity(CanonicalField::ALL.len());
    for field in CanonicalField::ALL {
        let hit = matchers_for(field, kind).iter().find_map(|matcher| {
            normalized
                .iter()
                .position(|header| matcher_satisfied(matcher, header))
                .map(|idx| (idx, matcher_kind(matcher)))
        });
        match hit {
            Some((idx, matcher)) => {
                indices.insert(field, idx);
                detections.push(Detection {
                    field,
                    header: headers.get(idx).cloned(),
                    index: Some(idx),
                    matcher: Some(matcher),
                });
            }
            None => {
                debug!(field = field.name(), "column not detected");
                detections.push(Detection {
                    field,
                    header: None,
                    index: None,
                    matcher: None,
                });
            }
        }
    }

    if !indices.contains_key(&CanonicalField::NetAmount) {
        return Err(ResolveError::MissingRequired(
            CanonicalField::NetAmount.name(),
        ));
    }
    Ok(ColumnMap {
        indices,
        detections,
    })
}

fn matcher_satisfied(matcher: &Matcher, normalized_header: &str) -> bool {
    if normalized_header.is_empty() {
        return false;
    }
    match matcher {
        Matcher::Exact(target) => normalized_header == *target,
        Matcher::Substring(target) => normalized_header.contains(target),
        Matcher::Fuzzy(target) => jaro_winkler(normalized_header, target) >= FUZZY_THRESHOLD,
    }
}

fn matcher_kind(matcher: &Matcher) -> MatcherKind {
    match matcher {
        Matcher::Exact(_) => MatcherKind::Exact,
        Matcher::Substring(_) => MatcherKind::Substring,
        Matcher::Fuzzy(_) => MatcherKind::Fuzzy,
    }
}

/// Per-batch inputs the normalizer needs beyond the row itself.
#[derive(Debug, Clone)]
pub struct NormalizeContext {
    /// Date assigned when a row carries an amount but no parsable date, so
    /// the row is kept instead of silently dropped.
    pub fallback_date: NaiveDate,
}

const SUMMARY_LABELS: [&str; 2] = ["grand total", "total"];
const POS_CHANNEL_LABEL: &str = "point of sale";

/// Convert one raw row into a canonical record, or classify why it is
/// excluded. Staff attribution happens separately in the pipeline.
pub fn normalize_row(
    row: &[String],
    columns: &ColumnMap,
    source_kind: SourceKind,
    ctx: &NormalizeContext,
) -> Result<SaleRecord, SkipReason> {
    if row.iter().all(|cell| cell.trim().is_empty()) {
        return Err(SkipReason::Empty);
    }

    let first_cell = row.first().map(|c| c.trim()).unwrap_or_default();
    let reference_cell = columns.cell(row, CanonicalField::OrderReference);
    if is_summary_label(first_cell) || reference_cell.is_some_and(is_summary_label) {
        return Err(SkipReason::Summary);
    }

    let channel_label = columns
        .cell(row, CanonicalField::SalesChannel)
        .map(str::to_string);
    // Known report-overlap defect: POS rows leak into online exports.
    if source_kind == SourceKind::Online
        && channel_label
            .as_deref()
            .is_some_and(|label| label.to_ascii_lowercase().contains(POS_CHANNEL_LABEL))
    {
        return Err(SkipReason::CrossChannel);
    }

    let net_cell = columns
        .cell(row, CanonicalField::NetAmount)
        .ok_or_else(|| SkipReason::Invalid {
            detail: "empty net amount".to_string(),
        })?;
    let net_amount = parse_amount(net_cell).ok_or_else(|| SkipReason::Invalid {
        detail: format!("unparsable net amount {net_cell:?}"),
    })?;

    let order_date = columns
        .cell(row, CanonicalField::OrderDate)
        .and_then(parse_date)
        .unwrap_or(ctx.fallback_date);

    Ok(SaleRecord {
        id: Uuid::new_v4(),
        source_channel: source_kind,
        order_date,
        actual_order_date: columns
            .cell(row, CanonicalField::ActualOrderDate)
            .and_then(parse_date),
        order_reference: reference_cell.map(str::to_string),
        sales_channel_label: channel_label,
        payment_gateway: columns
            .cell(row, CanonicalField::PaymentGateway)
            .map(str::to_string),
        net_amount,
        total_amount: columns
            .cell(row, CanonicalField::TotalAmount)
            .and_then(parse_amount),
        shipping_amount: columns
            .cell(row, CanonicalField::ShippingAmount)
            .and_then(parse_amount),
        staff: None,
        customer_email: columns
            .cell(row, CanonicalField::CustomerEmail)
            .map(str::to_string),
        marketing: MarketingFlags {
            email: columns
                .cell(row, CanonicalField::MarketingEmail)
                .and_then(parse_flag),
            sms: columns
                .cell(row, CanonicalField::MarketingSms)
                .and_then(parse_flag),
            whatsapp: columns
                .cell(row, CanonicalField::MarketingWhatsapp)
                .and_then(parse_flag),
        },
        ingested_at: chrono::Utc::now(),
    })
}

fn is_summary_label(cell: &str) -> bool {
    SUMMARY_LABELS
        .iter()
        .any(|label| cell.eq_ignore_ascii_case(label))
}

/// Currency coercion: strip everything that is not a digit, sign, or
/// decimal point, then parse. "$1,234.50" → 1234.5.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%m-%d-%Y", "%m/%d/%Y", "%m/%d/%y"];
const LOOSE_DATE_FORMATS: [&str; 5] = ["%d-%m-%Y", "%Y/%m/%d", "%B %d, %Y", "%b %d, %Y", "%d %b %Y"];
const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

/// Multi-format date parse: ISO first, then the US dashed/slashed variants
/// report vintages drift between, then a loose text-date pass.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    for format in DATE_FORMATS.iter().chain(LOOSE_DATE_FORMATS.iter()) {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Some(date);
        }
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt.date());
        }
    }
    None
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "yes" | "y" | "true" | "1" => Some(true),
        "no" | "n" | "false" | "0" => Some(false),
        _ => None,
    }
}

/// Lookup tables the staff resolver draws on, built once per batch.
#[derive(Debug, Clone, Default)]
pub struct StaffContext {
    /// Order reference → staff name, supplied by the uploading client from a
    /// richer source document.
    pub client_map: HashMap<String, String>,
    /// Staff identifier → display name from the admin-owned directory.
    pub directory: HashMap<String, String>,
}

const STAFF_TAG_MIN_DIGITS: usize = 4;

/// Resolve a staff identity for one row, first match wins: the POS
/// staff-name column, then the client-supplied reference map, then an
/// embedded tag identifier checked against the directory. An identifier
/// missing from the directory is preserved as "Unknown Staff <id>". No match
/// is a valid, unattributed outcome.
pub fn resolve_staff(
    row: &[String],
    columns: &ColumnMap,
    source_kind: SourceKind,
    ctx: &StaffContext,
) -> Option<StaffRef> {
    // Only POS reports carry a trustworthy staff-name column.
    if source_kind == SourceKind::Pos {
        if let Some(name) = columns.cell(row, CanonicalField::StaffName) {
            return Some(StaffRef::from_column(name));
        }
    }

    if let Some(reference) = columns.cell(row, CanonicalField::OrderReference) {
        if let Some(name) = ctx.client_map.get(reference.trim()) {
            return Some(StaffRef::from_client_map(name.clone()));
        }
    }

    if let Some(tags) = columns.cell(row, CanonicalField::StaffTag) {
        if let Some(id) = extract_staff_id(tags) {
            return Some(match ctx.directory.get(id) {
                Some(name) => StaffRef::from_directory(id, name.clone()),
                None => StaffRef::unknown(id),
            });
        }
    }

    None
}

/// A staff identifier embedded in the tag field is a comma-separated token
/// of four or more digits.
pub fn extract_staff_id(tags: &str) -> Option<&str> {
    tags.split(',').map(str::trim).find(|token| {
        token.len() >= STAFF_TAG_MIN_DIGITS && token.chars().all(|c| c.is_ascii_digit())
    })
}

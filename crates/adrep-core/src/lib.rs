//! Core domain model for ad-performance report retrieval: report requests,
//! report-kind presets, batch planning, and tabular payload reshaping.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "adrep-core";

/// How long a fetched phrase record stays authoritative before a refetch.
pub const FRESHNESS_WINDOW_DAYS: i64 = 7;

/// Per-call cardinality limit for campaign-scoped report and get calls.
pub const CAMPAIGN_BATCH_LIMIT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOperator {
    In,
    NotIn,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::In => "IN",
            FilterOperator::NotIn => "NOT_IN",
        }
    }
}

/// Entity selection predicate for one report: `field` IN/NOT_IN `ids`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityFilter {
    pub field: String,
    pub operator: FilterOperator,
    pub ids: Vec<u64>,
}

impl EntityFilter {
    pub fn including(field: impl Into<String>, ids: Vec<u64>) -> Self {
        Self {
            field: field.into(),
            operator: FilterOperator::In,
            ids,
        }
    }

    pub fn excluding(field: impl Into<String>, ids: Vec<u64>) -> Self {
        Self {
            field: field.into(),
            operator: FilterOperator::NotIn,
            ids,
        }
    }
}

/// Inclusive calendar date range for a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Aggregation {
    /// One output row per entity in the selection.
    PerEntity,
    /// A single aggregate row over the whole selection.
    SingleRow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    Tsv,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Tsv => "TSV",
        }
    }
}

/// Declared value type of one report column, used for permissive parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Integer,
    Float,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn integer(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Integer,
        }
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Float,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Text,
        }
    }
}

/// Built-in report presets. The remote service exposes one polling protocol
/// for every report type; only the field list, grouping, and type string
/// vary, so the variation lives here as data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportKind {
    CampaignPerformance,
    CampaignSummary,
    AdPerformance,
    AdGroupPerformance,
    SearchQueryPerformance,
}

impl ReportKind {
    pub fn report_type(&self) -> &'static str {
        match self {
            ReportKind::CampaignPerformance => "CAMPAIGN_PERFORMANCE_REPORT",
            ReportKind::CampaignSummary => "CUSTOM_REPORT",
            ReportKind::AdPerformance => "AD_PERFORMANCE_REPORT",
            ReportKind::AdGroupPerformance => "ADGROUP_PERFORMANCE_REPORT",
            ReportKind::SearchQueryPerformance => "SEARCH_QUERY_PERFORMANCE_REPORT",
        }
    }

    pub fn aggregation(&self) -> Aggregation {
        match self {
            ReportKind::CampaignSummary => Aggregation::SingleRow,
            _ => Aggregation::PerEntity,
        }
    }

    /// Entity field the selection filter applies to.
    pub fn filter_field(&self) -> &'static str {
        "CampaignId"
    }

    pub fn fields(&self) -> Vec<FieldSpec> {
        match self {
            ReportKind::CampaignPerformance => vec![
                FieldSpec::integer("CampaignId"),
                FieldSpec::text("CampaignName"),
                FieldSpec::integer("Impressions"),
                FieldSpec::integer("Clicks"),
                FieldSpec::float("Ctr"),
                FieldSpec::float("BounceRate"),
                FieldSpec::float("Cost"),
                FieldSpec::float("AvgCpc"),
            ],
            ReportKind::CampaignSummary => vec![
                FieldSpec::integer("Impressions"),
                FieldSpec::integer("Clicks"),
                FieldSpec::float("Ctr"),
                FieldSpec::float("Cost"),
                FieldSpec::float("AvgCpc"),
            ],
            ReportKind::AdPerformance => vec![
                FieldSpec::integer("AdId"),
                FieldSpec::integer("AdGroupId"),
                FieldSpec::integer("CampaignId"),
                FieldSpec::integer("Impressions"),
                FieldSpec::integer("Clicks"),
                FieldSpec::float("Ctr"),
                FieldSpec::float("Cost"),
                FieldSpec::float("AvgCpc"),
            ],
            ReportKind::AdGroupPerformance => vec![
                FieldSpec::integer("AdGroupId"),
                FieldSpec::text("AdGroupName"),
                FieldSpec::integer("CampaignId"),
                FieldSpec::integer("Impressions"),
                FieldSpec::integer("Clicks"),
                FieldSpec::float("Ctr"),
            ],
            ReportKind::SearchQueryPerformance => vec![
                FieldSpec::text("Query"),
                FieldSpec::integer("Impressions"),
                FieldSpec::integer("Clicks"),
                FieldSpec::float("Ctr"),
            ],
        }
    }
}

/// Immutable description of one report job. One instance per logical report;
/// the protocol client re-submits the same value on every poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRequest {
    pub report_name: String,
    pub report_type: String,
    pub filter: EntityFilter,
    /// Optional NOT_IN filter, used to exclude removed ad groups.
    pub exclusion: Option<EntityFilter>,
    pub date_range: DateRange,
    pub fields: Vec<FieldSpec>,
    pub aggregation: Aggregation,
    pub format: OutputFormat,
}

impl ReportRequest {
    pub fn from_preset(
        kind: ReportKind,
        report_name: impl Into<String>,
        entity_ids: Vec<u64>,
        date_range: DateRange,
    ) -> Self {
        Self {
            report_name: report_name.into(),
            report_type: kind.report_type().to_string(),
            filter: EntityFilter::including(kind.filter_field(), entity_ids),
            exclusion: None,
            date_range,
            fields: kind.fields(),
            aggregation: kind.aggregation(),
            format: OutputFormat::Tsv,
        }
    }

    pub fn custom(
        report_name: impl Into<String>,
        report_type: impl Into<String>,
        filter: EntityFilter,
        date_range: DateRange,
        fields: Vec<FieldSpec>,
        aggregation: Aggregation,
    ) -> Self {
        Self {
            report_name: report_name.into(),
            report_type: report_type.into(),
            filter,
            exclusion: None,
            date_range,
            fields,
            aggregation,
            format: OutputFormat::Tsv,
        }
    }

    pub fn with_excluded_groups(mut self, ad_group_ids: Vec<u64>) -> Self {
        if !ad_group_ids.is_empty() {
            self.exclusion = Some(EntityFilter::excluding("AdGroupId", ad_group_ids));
        }
        self
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }
}

/// Typed cell value in a reshaped report row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

/// One normalized output row: declared field name -> typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ReportRow {
    pub values: BTreeMap<String, FieldValue>,
}

impl ReportRow {
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.values.get(field)
    }
}

/// Split an oversized ID list into order-preserving chunks of at most
/// `max_batch` items. No reordering, no deduplication; the limit is a
/// property of the target call and is supplied by the caller.
pub fn plan_batches<T: Clone>(ids: &[T], max_batch: usize) -> Vec<Vec<T>> {
    let size = max_batch.max(1);
    ids.chunks(size).map(|chunk| chunk.to_vec()).collect()
}

fn parse_field(token: &str, kind: FieldKind) -> FieldValue {
    let token = token.trim();
    match kind {
        FieldKind::Integer => FieldValue::Integer(token.parse::<i64>().unwrap_or(0)),
        FieldKind::Float => FieldValue::Float(token.parse::<f64>().unwrap_or(0.0)),
        FieldKind::Text => FieldValue::Text(token.to_string()),
    }
}

/// Convert the protocol's raw tabular payload into normalized rows.
///
/// The payload starts with a report-level header line and a column-name
/// line, both discarded, and may end with a literal `Total rows:` summary
/// line. Data lines are tab-separated and mapped positionally onto
/// `fields`. Parsing is lossy by contract: malformed numeric tokens become
/// zero and never produce an error.
pub fn reshape(raw: &str, fields: &[FieldSpec]) -> Vec<ReportRow> {
    let mut lines: Vec<&str> = raw.lines().skip(2).collect();

    while matches!(lines.last(), Some(last) if last.trim().is_empty()) {
        lines.pop();
    }
    if matches!(lines.last(), Some(last) if last.trim_start().starts_with("Total rows:")) {
        lines.pop();
    }

    lines
        .into_iter()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let mut tokens = line.split('\t');
            let mut row = ReportRow::default();
            for spec in fields {
                let token = tokens.next().unwrap_or("");
                row.values
                    .insert(spec.name.clone(), parse_field(token, spec.kind));
            }
            row
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_preserve_order_and_respect_limit() {
        let ids: Vec<u64> = (1..=10).collect();
        let batches = plan_batches(&ids, 3);

        assert_eq!(batches.len(), 4);
        assert!(batches.iter().all(|b| b.len() <= 3));
        let rejoined: Vec<u64> = batches.into_iter().flatten().collect();
        assert_eq!(rejoined, ids);
    }

    #[test]
    fn batch_count_is_minimal() {
        let ids: Vec<u64> = (1..=9).collect();
        assert_eq!(plan_batches(&ids, 3).len(), 3);
        assert_eq!(plan_batches(&ids, 10).len(), 1);
        assert_eq!(plan_batches(&ids, 1).len(), 9);
    }

    #[test]
    fn batching_keeps_duplicates() {
        let ids = vec![7u64, 7, 7, 7];
        let batches = plan_batches(&ids, 3);
        assert_eq!(batches, vec![vec![7, 7, 7], vec![7]]);
    }

    #[test]
    fn zero_limit_does_not_panic() {
        let batches = plan_batches(&[1u64, 2], 0);
        assert_eq!(batches, vec![vec![1], vec![2]]);
    }

    #[test]
    fn reshape_drops_headers_and_total_rows_line() {
        let raw = "Report Header\nCol1\tCol2\nfoo\t10\nbar\t20\nTotal rows: 2";
        let fields = vec![FieldSpec::text("Name"), FieldSpec::integer("Count")];
        let rows = reshape(raw, &fields);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("Name"), Some(&FieldValue::Text("foo".into())));
        assert_eq!(rows[0].get("Count"), Some(&FieldValue::Integer(10)));
        assert_eq!(rows[1].get("Name"), Some(&FieldValue::Text("bar".into())));
        assert_eq!(rows[1].get("Count"), Some(&FieldValue::Integer(20)));
    }

    #[test]
    fn total_rows_trailer_is_dropped_even_after_trailing_blank_lines() {
        let raw = "Report Header\nCol1\tCol2\nfoo\t10\nbar\t20\nTotal rows: 2\n\n";
        let fields = vec![FieldSpec::text("Name"), FieldSpec::integer("Count")];
        let rows = reshape(raw, &fields);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get("Name"), Some(&FieldValue::Text("bar".into())));
    }

    #[test]
    fn reshape_skips_blank_lines() {
        let raw = "Header\nCols\nfoo\t1\n\n   \nbar\t2\n";
        let fields = vec![FieldSpec::text("Name"), FieldSpec::integer("Count")];
        let rows = reshape(raw, &fields);
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn malformed_numeric_tokens_parse_to_zero() {
        let raw = "Header\nCols\nfoo\tN/A\t--\n";
        let fields = vec![
            FieldSpec::text("Name"),
            FieldSpec::integer("Clicks"),
            FieldSpec::float("Ctr"),
        ];
        let rows = reshape(raw, &fields);

        assert_eq!(rows[0].get("Clicks"), Some(&FieldValue::Integer(0)));
        assert_eq!(rows[0].get("Ctr"), Some(&FieldValue::Float(0.0)));
    }

    #[test]
    fn decimal_tokens_parse_as_floats() {
        let raw = "Header\nCols\n12345\tCampaign A\t1000\t50\t5.0\t12.5\n";
        let fields = vec![
            FieldSpec::integer("CampaignId"),
            FieldSpec::text("CampaignName"),
            FieldSpec::integer("Impressions"),
            FieldSpec::integer("Clicks"),
            FieldSpec::float("Ctr"),
            FieldSpec::float("BounceRate"),
        ];
        let rows = reshape(raw, &fields);

        assert_eq!(rows[0].get("CampaignId"), Some(&FieldValue::Integer(12345)));
        assert_eq!(rows[0].get("Ctr"), Some(&FieldValue::Float(5.0)));
        assert_eq!(rows[0].get("BounceRate"), Some(&FieldValue::Float(12.5)));
    }

    #[test]
    fn missing_trailing_columns_read_as_empty() {
        let raw = "Header\nCols\nfoo\n";
        let fields = vec![FieldSpec::text("Name"), FieldSpec::integer("Count")];
        let rows = reshape(raw, &fields);
        assert_eq!(rows[0].get("Count"), Some(&FieldValue::Integer(0)));
    }

    #[test]
    fn empty_payload_yields_no_rows() {
        let fields = vec![FieldSpec::text("Name")];
        assert!(reshape("", &fields).is_empty());
        assert!(reshape("Header\nCols\nTotal rows: 0", &fields).is_empty());
    }

    #[test]
    fn presets_carry_their_own_field_lists() {
        let range = DateRange {
            from: NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
            to: NaiveDate::from_ymd_opt(2026, 8, 31).unwrap(),
        };
        let request = ReportRequest::from_preset(
            ReportKind::CampaignPerformance,
            "Campaign Performance Report",
            vec![101, 102],
            range,
        );

        assert_eq!(request.report_type, "CAMPAIGN_PERFORMANCE_REPORT");
        assert_eq!(request.filter.operator, FilterOperator::In);
        assert_eq!(request.filter.field, "CampaignId");
        assert_eq!(request.aggregation, Aggregation::PerEntity);
        assert!(request.field_names().contains(&"BounceRate"));
    }

    #[test]
    fn summary_preset_is_single_row() {
        assert_eq!(
            ReportKind::CampaignSummary.aggregation(),
            Aggregation::SingleRow
        );
        assert!(!ReportKind::CampaignSummary
            .fields()
            .iter()
            .any(|f| f.name == "CampaignId"));
    }

    #[test]
    fn exclusion_filter_is_attached_only_when_non_empty() {
        let range = DateRange {
            from: NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
            to: NaiveDate::from_ymd_opt(2026, 8, 31).unwrap(),
        };
        let base = ReportRequest::from_preset(
            ReportKind::CampaignPerformance,
            "r",
            vec![1],
            range,
        );

        assert!(base.clone().with_excluded_groups(vec![]).exclusion.is_none());

        let filtered = base.with_excluded_groups(vec![55, 56]);
        let exclusion = filtered.exclusion.expect("exclusion present");
        assert_eq!(exclusion.operator, FilterOperator::NotIn);
        assert_eq!(exclusion.field, "AdGroupId");
        assert_eq!(exclusion.ids, vec![55, 56]);
    }
}

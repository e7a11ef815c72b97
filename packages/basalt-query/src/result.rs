//! Internal result row forms that travel between data nodes and the broker.
//!
//! Aggregation kinds share the compact positional row `[timestamp, dims...,
//! aggs...]` so the merge loop can combine in place at fixed offsets; the
//! remaining kinds carry their own shapes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use basalt_agg::AggState;
use basalt_core::{Interval, Scalar};
use basalt_storage::ColumnAnalysis;

/// Positional row: index 0 is the bucket timestamp, the next `dims` entries
/// are grouping values, aggregator `i` sits at `dims + 1 + i`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactRow {
    pub columns: Vec<AggState>,
}

impl CompactRow {
    pub fn new(timestamp: i64, dims: Vec<String>, aggs: Vec<AggState>) -> CompactRow {
        let mut columns = Vec::with_capacity(1 + dims.len() + aggs.len());
        columns.push(AggState::Long(timestamp));
        columns.extend(
            dims.into_iter()
                .map(|d| AggState::Value(Scalar::String(d))),
        );
        columns.extend(aggs);
        CompactRow { columns }
    }

    pub fn timestamp(&self) -> i64 {
        match self.columns.first() {
            Some(AggState::Long(ts)) => *ts,
            _ => 0,
        }
    }

    pub fn dims(&self, num_dims: usize) -> Vec<String> {
        self.columns[1..1 + num_dims]
            .iter()
            .map(|v| match v {
                AggState::Value(Scalar::String(s)) => s.clone(),
                other => other
                    .order_key()
                    .as_str()
                    .map(|s| s.to_string())
                    .unwrap_or_default(),
            })
            .collect()
    }

    pub fn agg(&self, num_dims: usize, i: usize) -> &AggState {
        &self.columns[num_dims + 1 + i]
    }

    pub fn agg_mut(&mut self, num_dims: usize, i: usize) -> &mut AggState {
        &mut self.columns[num_dims + 1 + i]
    }

    /// Merge key: timestamp plus grouping values.
    pub fn group_key(&self, num_dims: usize) -> (i64, Vec<String>) {
        (self.timestamp(), self.dims(num_dims))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectEvent {
    #[serde(rename = "segmentId")]
    pub segment_id: String,
    pub offset: u64,
    pub timestamp: i64,
    pub event: HashMap<String, Json>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SelectBatch {
    #[serde(rename = "pagingIdentifiers")]
    pub paging_identifiers: HashMap<String, u64>,
    pub events: Vec<SelectEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub timestamp: i64,
    pub dimension: String,
    pub value: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentAnalysis {
    pub id: String,
    pub interval: Option<Interval>,
    pub columns: HashMap<String, ColumnAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregators: Option<Vec<basalt_agg::AggregatorSpec>>,
    #[serde(rename = "queryGranularity", skip_serializing_if = "Option::is_none")]
    pub query_granularity: Option<basalt_core::Granularity>,
    pub rollup: bool,
    #[serde(rename = "numRows")]
    pub num_rows: u64,
    #[serde(rename = "ingestedNumRows")]
    pub ingested_rows: u64,
    #[serde(rename = "lastAccessTime", skip_serializing_if = "Option::is_none")]
    pub last_access_time: Option<i64>,
    pub size: u64,
}

/// One streamed result element. Externally tagged so both the JSON and the
/// compact binary wire can carry it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResultItem {
    #[serde(rename = "row")]
    Row(CompactRow),
    #[serde(rename = "select")]
    Select(SelectBatch),
    #[serde(rename = "search")]
    Search(SearchHit),
    #[serde(rename = "metadata")]
    Metadata(SegmentAnalysis),
    /// Unmerged per-segment block (`bySegment=true`).
    #[serde(rename = "bySegment")]
    BySegment {
        #[serde(rename = "segmentId")]
        segment_id: String,
        interval: Interval,
        results: Vec<ResultItem>,
    },
}

impl ResultItem {
    pub fn as_row(&self) -> Option<&CompactRow> {
        match self {
            ResultItem::Row(row) => Some(row),
            _ => None,
        }
    }

    pub fn into_row(self) -> Option<CompactRow> {
        match self {
            ResultItem::Row(row) => Some(row),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_row_offsets() {
        let row = CompactRow::new(
            60_000,
            vec!["jp".into()],
            vec![AggState::Long(3), AggState::Double(1.5)],
        );
        assert_eq!(row.timestamp(), 60_000);
        assert_eq!(row.dims(1), vec!["jp"]);
        // aggregator i lives at dims + 1 + i
        assert_eq!(row.agg(1, 0), &AggState::Long(3));
        assert_eq!(row.agg(1, 1), &AggState::Double(1.5));
    }

    #[test]
    fn test_result_item_wire_round_trip() {
        let item = ResultItem::Row(CompactRow::new(0, vec![], vec![AggState::Long(1)]));
        let json = serde_json::to_string(&item).unwrap();
        let back: ResultItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_row().unwrap().timestamp(), 0);
    }
}

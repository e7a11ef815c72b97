//! Declarative query model, serde-tagged by `queryType`.

use serde::{Deserialize, Serialize};

use basalt_agg::{AggregatorSpec, PostAggregatorSpec};
use basalt_core::{BasaltError, Granularity, Interval, Result};
use basalt_storage::{DimFilter, VirtualColumnSpec};

use crate::context::QueryContext;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "queryType")]
pub enum Query {
    #[serde(rename = "timeseries")]
    Timeseries(TimeseriesQuery),
    #[serde(rename = "topN")]
    TopN(TopNQuery),
    #[serde(rename = "groupBy")]
    GroupBy(GroupByQuery),
    #[serde(rename = "select")]
    Select(SelectQuery),
    #[serde(rename = "search")]
    Search(SearchQuery),
    #[serde(rename = "segmentMetadata")]
    SegmentMetadata(SegmentMetadataQuery),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeseriesQuery {
    #[serde(rename = "dataSource")]
    pub data_source: String,
    pub intervals: Vec<Interval>,
    #[serde(default)]
    pub filter: Option<DimFilter>,
    #[serde(rename = "virtualColumns", default)]
    pub virtual_columns: Vec<VirtualColumnSpec>,
    #[serde(default = "default_granularity")]
    pub granularity: Granularity,
    #[serde(rename = "aggregations", alias = "aggregators", default)]
    pub aggregations: Vec<AggregatorSpec>,
    #[serde(rename = "postAggregations", default)]
    pub post_aggregations: Vec<PostAggregatorSpec>,
    #[serde(default)]
    pub descending: bool,
    #[serde(default)]
    pub context: QueryContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopNQuery {
    #[serde(rename = "dataSource")]
    pub data_source: String,
    pub intervals: Vec<Interval>,
    pub dimension: String,
    pub metric: String,
    pub threshold: usize,
    #[serde(default)]
    pub filter: Option<DimFilter>,
    #[serde(rename = "virtualColumns", default)]
    pub virtual_columns: Vec<VirtualColumnSpec>,
    #[serde(default = "default_granularity")]
    pub granularity: Granularity,
    #[serde(rename = "aggregations", alias = "aggregators", default)]
    pub aggregations: Vec<AggregatorSpec>,
    #[serde(rename = "postAggregations", default)]
    pub post_aggregations: Vec<PostAggregatorSpec>,
    #[serde(default)]
    pub context: QueryContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupByQuery {
    #[serde(rename = "dataSource")]
    pub data_source: String,
    pub intervals: Vec<Interval>,
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub filter: Option<DimFilter>,
    #[serde(rename = "virtualColumns", default)]
    pub virtual_columns: Vec<VirtualColumnSpec>,
    #[serde(default = "default_granularity")]
    pub granularity: Granularity,
    #[serde(rename = "aggregations", alias = "aggregators", default)]
    pub aggregations: Vec<AggregatorSpec>,
    #[serde(rename = "postAggregations", default)]
    pub post_aggregations: Vec<PostAggregatorSpec>,
    /// Having clause evaluated over finalized aggregate values.
    #[serde(default)]
    pub having: Option<String>,
    #[serde(rename = "limit", default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub context: QueryContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectQuery {
    #[serde(rename = "dataSource")]
    pub data_source: String,
    pub intervals: Vec<Interval>,
    #[serde(default)]
    pub filter: Option<DimFilter>,
    #[serde(rename = "virtualColumns", default)]
    pub virtual_columns: Vec<VirtualColumnSpec>,
    #[serde(default = "default_granularity")]
    pub granularity: Granularity,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(rename = "pagingSpec", default)]
    pub paging: PagingSpec,
    #[serde(default)]
    pub descending: bool,
    #[serde(default)]
    pub context: QueryContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PagingSpec {
    /// Per-segment row offsets to resume from.
    #[serde(rename = "pagingIdentifiers", default)]
    pub identifiers: std::collections::HashMap<String, u64>,
    #[serde(default = "default_page_size")]
    pub threshold: usize,
}

impl Default for PagingSpec {
    fn default() -> PagingSpec {
        PagingSpec {
            identifiers: Default::default(),
            threshold: default_page_size(),
        }
    }
}

fn default_page_size() -> usize {
    1000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    #[serde(rename = "dataSource")]
    pub data_source: String,
    pub intervals: Vec<Interval>,
    #[serde(rename = "searchDimensions", default)]
    pub search_dimensions: Vec<String>,
    /// Case-insensitive substring to look for in dimension values.
    pub query: String,
    #[serde(default)]
    pub filter: Option<DimFilter>,
    #[serde(rename = "virtualColumns", default)]
    pub virtual_columns: Vec<VirtualColumnSpec>,
    #[serde(default = "default_granularity")]
    pub granularity: Granularity,
    #[serde(default = "default_search_limit")]
    pub limit: usize,
    #[serde(default)]
    pub context: QueryContext,
}

fn default_search_limit() -> usize {
    1000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMetadataQuery {
    #[serde(rename = "dataSource")]
    pub data_source: String,
    #[serde(default)]
    pub intervals: Vec<Interval>,
    /// Which analyses to include; empty means all.
    #[serde(rename = "analysisTypes", default)]
    pub analysis_types: Vec<String>,
    #[serde(default)]
    pub context: QueryContext,
}

fn default_granularity() -> Granularity {
    Granularity::All
}

impl Query {
    pub fn kind(&self) -> &'static str {
        match self {
            Query::Timeseries(_) => "timeseries",
            Query::TopN(_) => "topN",
            Query::GroupBy(_) => "groupBy",
            Query::Select(_) => "select",
            Query::Search(_) => "search",
            Query::SegmentMetadata(_) => "segmentMetadata",
        }
    }

    pub fn data_source(&self) -> &str {
        match self {
            Query::Timeseries(q) => &q.data_source,
            Query::TopN(q) => &q.data_source,
            Query::GroupBy(q) => &q.data_source,
            Query::Select(q) => &q.data_source,
            Query::Search(q) => &q.data_source,
            Query::SegmentMetadata(q) => &q.data_source,
        }
    }

    pub fn intervals(&self) -> &[Interval] {
        match self {
            Query::Timeseries(q) => &q.intervals,
            Query::TopN(q) => &q.intervals,
            Query::GroupBy(q) => &q.intervals,
            Query::Select(q) => &q.intervals,
            Query::Search(q) => &q.intervals,
            Query::SegmentMetadata(q) => &q.intervals,
        }
    }

    pub fn context(&self) -> &QueryContext {
        match self {
            Query::Timeseries(q) => &q.context,
            Query::TopN(q) => &q.context,
            Query::GroupBy(q) => &q.context,
            Query::Select(q) => &q.context,
            Query::Search(q) => &q.context,
            Query::SegmentMetadata(q) => &q.context,
        }
    }

    pub fn context_mut(&mut self) -> &mut QueryContext {
        match self {
            Query::Timeseries(q) => &mut q.context,
            Query::TopN(q) => &mut q.context,
            Query::GroupBy(q) => &mut q.context,
            Query::Select(q) => &mut q.context,
            Query::Search(q) => &mut q.context,
            Query::SegmentMetadata(q) => &mut q.context,
        }
    }

    pub fn aggregations(&self) -> &[AggregatorSpec] {
        match self {
            Query::Timeseries(q) => &q.aggregations,
            Query::TopN(q) => &q.aggregations,
            Query::GroupBy(q) => &q.aggregations,
            _ => &[],
        }
    }

    pub fn post_aggregations(&self) -> &[PostAggregatorSpec] {
        match self {
            Query::Timeseries(q) => &q.post_aggregations,
            Query::TopN(q) => &q.post_aggregations,
            Query::GroupBy(q) => &q.post_aggregations,
            _ => &[],
        }
    }

    /// Grouping dimension names; empty for timeseries and friends.
    pub fn dimensions(&self) -> Vec<String> {
        match self {
            Query::TopN(q) => vec![q.dimension.clone()],
            Query::GroupBy(q) => q.dimensions.clone(),
            _ => Vec::new(),
        }
    }

    pub fn descending(&self) -> bool {
        match self {
            Query::Timeseries(q) => q.descending,
            Query::Select(q) => q.descending,
            _ => false,
        }
    }

    /// Basic shape validation at plan time.
    pub fn validate(&self) -> Result<()> {
        if self.data_source().is_empty() {
            return Err(BasaltError::IllegalArgument("empty dataSource".into()));
        }
        match self {
            Query::TopN(q) => {
                if q.threshold == 0 {
                    return Err(BasaltError::IllegalArgument(
                        "topN threshold must be positive".into(),
                    ));
                }
                if q.aggregations.is_empty() {
                    return Err(BasaltError::IllegalArgument(
                        "topN requires aggregations".into(),
                    ));
                }
            }
            Query::GroupBy(q) => {
                if q.dimensions.is_empty() {
                    return Err(BasaltError::IllegalArgument(
                        "groupBy requires dimensions".into(),
                    ));
                }
                if let Some(having) = &q.having {
                    basalt_expr::parse(having)?;
                }
            }
            _ => {}
        }
        if let Some(f) = self.filter() {
            f.validate()?;
        }
        for spec in self.virtual_column_specs() {
            basalt_storage::VirtualColumns::compile(std::slice::from_ref(spec))?;
        }
        Ok(())
    }

    pub fn filter(&self) -> Option<&DimFilter> {
        match self {
            Query::Timeseries(q) => q.filter.as_ref(),
            Query::TopN(q) => q.filter.as_ref(),
            Query::GroupBy(q) => q.filter.as_ref(),
            Query::Select(q) => q.filter.as_ref(),
            Query::Search(q) => q.filter.as_ref(),
            Query::SegmentMetadata(_) => None,
        }
    }

    pub fn virtual_column_specs(&self) -> &[VirtualColumnSpec] {
        match self {
            Query::Timeseries(q) => &q.virtual_columns,
            Query::TopN(q) => &q.virtual_columns,
            Query::GroupBy(q) => &q.virtual_columns,
            Query::Select(q) => &q.virtual_columns,
            Query::Search(q) => &q.virtual_columns,
            Query::SegmentMetadata(_) => &[],
        }
    }

    pub fn granularity(&self) -> Granularity {
        match self {
            Query::Timeseries(q) => q.granularity,
            Query::TopN(q) => q.granularity,
            Query::GroupBy(q) => q.granularity,
            Query::Select(q) => q.granularity,
            Query::Search(q) => q.granularity,
            Query::SegmentMetadata(_) => Granularity::All,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_spec_scenario_query_parses() {
        let q: Query = serde_json::from_value(json!({
            "queryType": "timeseries",
            "dataSource": "events",
            "intervals": ["2020-01-01/P1D"],
            "granularity": "MINUTE",
            "aggregators": [{"type": "count", "name": "c"}]
        }))
        .unwrap();
        assert_eq!(q.kind(), "timeseries");
        assert_eq!(q.granularity(), Granularity::Minute);
        assert_eq!(q.aggregations().len(), 1);
    }

    #[test]
    fn test_topn_validation() {
        let q: Query = serde_json::from_value(json!({
            "queryType": "topN",
            "dataSource": "events",
            "intervals": ["2020-01-01/P1D"],
            "dimension": "k",
            "metric": "c",
            "threshold": 0,
            "aggregations": [{"type": "count", "name": "c"}]
        }))
        .unwrap();
        assert!(q.validate().is_err());
    }

    #[test]
    fn test_round_trip() {
        let q: Query = serde_json::from_value(json!({
            "queryType": "groupBy",
            "dataSource": "events",
            "intervals": ["2020-01-01/P1D"],
            "dimensions": ["k"],
            "aggregations": [{"type": "doubleSum", "name": "s", "fieldName": "v"}]
        }))
        .unwrap();
        let round: Query =
            serde_json::from_value(serde_json::to_value(&q).unwrap()).unwrap();
        assert_eq!(q, round);
    }
}

//! Data-node execution: run a query over every held segment of its
//! datasource, in parallel, then merge (or report per segment when
//! `bySegment` is set).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rayon::prelude::*;

use basalt_core::{Interval, QueryCancel, Result};
use basalt_storage::StorageAdapter;

use crate::engine::run_engine;
use crate::query::Query;
use crate::result::ResultItem;
use crate::toolchest::merge_items;

pub struct ShelfSegment {
    pub label: String,
    pub interval: Interval,
    pub adapter: Arc<dyn StorageAdapter>,
}

/// Segment shelf of one node: datasource → held segments (immutable ones
/// plus the live incremental index, registered the same way).
pub struct DataNode {
    shelves: RwLock<HashMap<String, Vec<Arc<ShelfSegment>>>>,
}

impl Default for DataNode {
    fn default() -> Self {
        Self::new()
    }
}

impl DataNode {
    pub fn new() -> DataNode {
        DataNode {
            shelves: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_segment(
        &self,
        datasource: &str,
        label: &str,
        interval: Interval,
        adapter: Arc<dyn StorageAdapter>,
    ) {
        self.shelves
            .write()
            .entry(datasource.to_string())
            .or_default()
            .push(Arc::new(ShelfSegment {
                label: label.to_string(),
                interval,
                adapter,
            }));
    }

    pub fn datasources(&self) -> Vec<String> {
        self.shelves.read().keys().cloned().collect()
    }

    pub fn segment_count(&self, datasource: &str) -> usize {
        self.shelves
            .read()
            .get(datasource)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Execute against every segment whose interval overlaps the query, fan
    /// out across the rayon pool, merge unless `bySegment`.
    pub fn run(&self, query: &Query, cancel: QueryCancel) -> Result<Vec<ResultItem>> {
        let segments: Vec<Arc<ShelfSegment>> = {
            let shelves = self.shelves.read();
            shelves
                .get(query.data_source())
                .map(|held| {
                    held.iter()
                        .filter(|s| {
                            query.intervals().is_empty()
                                || query
                                    .intervals()
                                    .iter()
                                    .any(|iv| iv.overlap(&s.interval).is_some())
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        if segments.is_empty() {
            return Ok(Vec::new());
        }

        let partials: Vec<(Arc<ShelfSegment>, Vec<ResultItem>)> = segments
            .par_iter()
            .map(|segment| {
                cancel.check()?;
                let items =
                    run_engine(query, segment.adapter.as_ref(), &segment.label, cancel.clone())?;
                Ok((Arc::clone(segment), items))
            })
            .collect::<Result<_>>()?;

        if query.context().by_segment() {
            return Ok(partials
                .into_iter()
                .map(|(segment, results)| ResultItem::BySegment {
                    segment_id: segment.label.clone(),
                    interval: segment.interval,
                    results,
                })
                .collect());
        }
        merge_items(query, partials.into_iter().map(|(_, items)| items).collect())
    }
}

use serde::{Deserialize, Serialize};

/// One row: ordered column names with their JSON values.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Read window for paged queries.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagingParams {
    pub skip: Option<i64>,
    pub take: Option<i64>,
    /// Whether the page should carry the total number of matches.
    pub total: bool,
}

impl PagingParams {
    pub fn new(skip: Option<i64>, take: Option<i64>, total: bool) -> Self {
        Self { skip, take, total }
    }

    pub fn with_skip(mut self, skip: i64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_take(mut self, take: i64) -> Self {
        self.take = Some(take);
        self
    }

    pub fn with_total(mut self) -> Self {
        self.total = true;
        self
    }

    /// Rows to skip, or `None` when unset or negative.
    pub fn skip(&self) -> Option<i64> {
        self.skip.filter(|s| *s >= 0)
    }

    /// Rows to take, defaulting to and capped at `max_take`.
    pub fn take(&self, max_take: i64) -> i64 {
        match self.take {
            None => max_take,
            Some(t) if t < 0 => 0,
            Some(t) => t.min(max_take),
        }
    }
}

/// A page of items, plus the total count when it was requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPage<T> {
    pub data: Vec<T>,
    pub total: Option<i64>,
}

impl<T> DataPage<T> {
    pub fn new(data: Vec<T>, total: Option<i64>) -> Self {
        Self { data, total }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

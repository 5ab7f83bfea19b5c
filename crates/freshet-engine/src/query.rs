//! Interactive query service.
//!
//! A read-only facade over the state store, bypassing the publish path.
//! Missing data is `NotFound`, not an error. While a restore is in progress
//! reads do not block: a key that is present is served from the last
//! committed data, a key that is absent answers `Rebuilding` because its
//! value may simply not have been reloaded yet.

use crate::store::StateStore;
use crate::window::Window;
use chrono::{DateTime, Utc};
use freshet_core::Value;
use std::sync::Arc;

/// Outcome of a read.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResponse<T> {
    Found(T),
    NotFound,
    /// A restore is in progress and this key has not (re)appeared yet.
    Rebuilding,
}

impl<T> QueryResponse<T> {
    pub fn found(self) -> Option<T> {
        match self {
            QueryResponse::Found(v) => Some(v),
            _ => None,
        }
    }
}

/// Read-only store facade. Cheap to clone and safe to call concurrently with
/// partition workers.
#[derive(Clone)]
pub struct QueryService {
    store: Arc<StateStore>,
}

impl QueryService {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// Point read of the latest value for a key.
    pub fn get_latest(&self, key: &str) -> QueryResponse<Value> {
        match self.store.get_latest(key) {
            Some(value) => QueryResponse::Found(value),
            None if self.store.is_rebuilding() => QueryResponse::Rebuilding,
            None => QueryResponse::NotFound,
        }
    }

    /// Point read of one window's result.
    pub fn get_window(&self, window: &Window) -> QueryResponse<Value> {
        match self.store.get_windowed(window) {
            Some(value) => QueryResponse::Found(value),
            None if self.store.is_rebuilding() => QueryResponse::Rebuilding,
            None => QueryResponse::NotFound,
        }
    }

    /// Windowed results for a key with window start in `[from, to)`,
    /// ascending by start.
    pub fn range(
        &self,
        key: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> QueryResponse<Vec<(Window, Value)>> {
        let hits = self.store.range_scan(key, from, to);
        if !hits.is_empty() {
            QueryResponse::Found(hits)
        } else if self.store.is_rebuilding() {
            QueryResponse::Rebuilding
        } else {
            QueryResponse::NotFound
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_found_and_not_found() {
        let store = Arc::new(StateStore::new());
        store.put_latest(&"p1".into(), Value::Float(9.99)).unwrap();
        let query = QueryService::new(store);

        assert_eq!(
            query.get_latest("p1"),
            QueryResponse::Found(Value::Float(9.99))
        );
        assert_eq!(query.get_latest("p2"), QueryResponse::NotFound);
    }

    #[test]
    fn test_range_scan() {
        let store = Arc::new(StateStore::new());
        let w = Window::new("A", at(0), at(60));
        store.put_windowed(&w, Value::Int(1)).unwrap();
        let query = QueryService::new(store);

        let QueryResponse::Found(hits) = query.range("A", at(0), at(120)) else {
            panic!("expected hits");
        };
        assert_eq!(hits, vec![(w, Value::Int(1))]);
        assert_eq!(query.range("A", at(60), at(120)), QueryResponse::NotFound);
    }
}

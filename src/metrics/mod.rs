//! Lock-free request counters.
//!
//! The registry owns one atomic per (name, label-set) time series;
//! increments never take a lock on the hot path. Exporters are external
//! and read the registry through `collect()`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::model;

pub const REQUESTS_TOTAL: &str = "e_requests_total";

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct SeriesKey {
    name: &'static str,
    labels: Vec<(&'static str, String)>,
}

#[derive(Debug, Default)]
pub struct Registry {
    series: DashMap<SeriesKey, Arc<AtomicU64>>,
}

/// One collected time series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub name: &'static str,
    pub labels: Vec<(&'static str, String)>,
    pub value: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the counter for the given series, creating it on first use.
    pub fn counter(
        &self,
        name: &'static str,
        labels: Vec<(&'static str, String)>,
    ) -> Arc<AtomicU64> {
        let key = SeriesKey { name, labels };
        if let Some(counter) = self.series.get(&key) {
            return counter.clone();
        }
        self.series
            .entry(key)
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    /// Records a completed request into the request counter.
    pub fn record_request_end(&self, resp: &model::Response) {
        let model::RequestData::Rpc(rpc) = &resp.request.data else {
            return;
        };
        let code = match &resp.data {
            model::ResponseData::Rpc(data) => match &data.error {
                Some(err) => err.code.to_string(),
                None => "ok".to_string(),
            },
            model::ResponseData::Auth(res) => match res {
                Ok(_) => "ok".to_string(),
                Err(err) => err.code.to_string(),
            },
            model::ResponseData::PubSub(res) => match res {
                Ok(_) => "ok".to_string(),
                Err(err) => err.code.to_string(),
            },
        };

        let labels = vec![
            ("service", rpc.endpoint_name.service().to_string()),
            ("endpoint", rpc.endpoint_name.endpoint().to_string()),
            ("code", code),
        ];
        self.counter(REQUESTS_TOTAL, labels)
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshots every series for an exporter.
    pub fn collect(&self) -> Vec<Sample> {
        let mut samples: Vec<Sample> = self
            .series
            .iter()
            .map(|entry| Sample {
                name: entry.key().name,
                labels: entry.key().labels.clone(),
                value: entry.value().load(Ordering::Acquire),
            })
            .collect();
        samples.sort_by(|a, b| (a.name, &a.labels).cmp(&(b.name, &b.labels)));
        samples
    }
}

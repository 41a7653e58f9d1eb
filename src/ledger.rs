use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Local};

/// One completed (or failed) exchange, immutable once recorded.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    /// Assigned by the ledger; strictly increasing from 1.
    pub id: u64,
    /// Wall-clock start of the exchange.
    pub timestamp: DateTime<Local>,
    /// Model string exactly as the client sent it.
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    pub cost: f64,
    pub latency: Duration,
    /// Final HTTP status; 0 when the exchange never produced one.
    pub status: u16,
    /// Set iff the client could not consume a response end-to-end.
    pub error: Option<String>,
}

/// Aggregate over all records sharing one model string.
#[derive(Debug, Clone, Default)]
pub struct ModelStats {
    pub model: String,
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    pub total_cost: f64,
}

/// Aggregate over the whole ledger.
#[derive(Debug, Clone, Copy, Default)]
pub struct Summary {
    pub total_requests: u64,
    pub total_cost: f64,
    pub total_input: u64,
    pub total_output: u64,
    pub total_cache_read: u64,
    pub total_cache_write: u64,
}

type RecordHook = Arc<dyn Fn(&RequestRecord) + Send + Sync>;

#[derive(Default)]
struct Records {
    entries: Vec<RequestRecord>,
    next_id: u64,
}

/// Append-only in-memory request store with snapshot aggregations.
///
/// Readers take the shared side of the lock; `record` and `clear` take the
/// exclusive side. The observer hook is never invoked under either.
#[derive(Default)]
pub struct Ledger {
    records: RwLock<Records>,
    on_record: RwLock<Option<RecordHook>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the observer invoked once per recorded request. Intended to
    /// be called at most once, before the server starts taking traffic.
    pub fn set_on_record<F>(&self, hook: F)
    where
        F: Fn(&RequestRecord) + Send + Sync + 'static,
    {
        *self.on_record.write().expect("ledger hook poisoned") = Some(Arc::new(hook));
    }

    /// Assign the next id, append, then fire the observer outside the lock
    /// so a slow or misbehaving callback cannot stall other recorders.
    pub fn record(&self, mut record: RequestRecord) -> u64 {
        let id;
        {
            let mut records = self.records.write().expect("ledger poisoned");
            records.next_id += 1;
            id = records.next_id;
            record.id = id;
            records.entries.push(record.clone());
        }

        let hook = self
            .on_record
            .read()
            .expect("ledger hook poisoned")
            .clone();
        if let Some(hook) = hook {
            hook(&record);
        }
        id
    }

    /// Snapshot of all records in insertion order.
    pub fn all(&self) -> Vec<RequestRecord> {
        self.records.read().expect("ledger poisoned").entries.clone()
    }

    /// Snapshot of the last `n` records, newest first.
    pub fn recent(&self, n: usize) -> Vec<RequestRecord> {
        let records = self.records.read().expect("ledger poisoned");
        records.entries.iter().rev().take(n).cloned().collect()
    }

    /// Per-model aggregates, sorted by descending total cost.
    pub fn per_model(&self) -> Vec<ModelStats> {
        let records = self.records.read().expect("ledger poisoned");

        let mut by_model: HashMap<&str, ModelStats> = HashMap::new();
        for r in &records.entries {
            let stats = by_model.entry(r.model.as_str()).or_insert_with(|| ModelStats {
                model: r.model.clone(),
                ..ModelStats::default()
            });
            stats.requests += 1;
            stats.input_tokens += r.input_tokens;
            stats.output_tokens += r.output_tokens;
            stats.cache_read += r.cache_read;
            stats.cache_write += r.cache_write;
            stats.total_cost += r.cost;
        }

        let mut stats: Vec<ModelStats> = by_model.into_values().collect();
        stats.sort_by(|a, b| {
            b.total_cost
                .partial_cmp(&a.total_cost)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        stats
    }

    pub fn summary(&self) -> Summary {
        let records = self.records.read().expect("ledger poisoned");

        let mut s = Summary {
            total_requests: records.entries.len() as u64,
            ..Summary::default()
        };
        for r in &records.entries {
            s.total_cost += r.cost;
            s.total_input += r.input_tokens;
            s.total_output += r.output_tokens;
            s.total_cache_read += r.cache_read;
            s.total_cache_write += r.cache_write;
        }
        s
    }

    /// Drop every record and restart ids from 1.
    pub fn clear(&self) {
        let mut records = self.records.write().expect("ledger poisoned");
        records.entries.clear();
        records.next_id = 0;
    }
}

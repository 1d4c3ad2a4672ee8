use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::llm::TokenUsage;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub operation: String,
    pub model: String,
    pub tokens: TokenUsage,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub records: Vec<UsageRecord>,
    pub total: TokenUsage,
}

fn sum_tokens(records: &[UsageRecord]) -> TokenUsage {
    let mut total = TokenUsage::default();
    for record in records {
        total.add(record.tokens);
    }
    total
}

/// Per-run token ledger shared by concurrent pipeline branches.
#[derive(Debug, Clone, Default)]
pub struct UsageLedger {
    records: Arc<Mutex<Vec<UsageRecord>>>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, operation: &str, model: &str, tokens: TokenUsage, latency_ms: u64) {
        info!(
            "usage: operation={} model={} input={} output={} latency_ms={}",
            operation, model, tokens.input, tokens.output, latency_ms
        );
        self.records.lock().push(UsageRecord {
            operation: operation.to_string(),
            model: model.to_string(),
            tokens,
            latency_ms,
        });
    }

    pub fn total(&self) -> TokenUsage {
        sum_tokens(&self.records.lock())
    }

    pub fn summary(&self) -> UsageSummary {
        // Snapshot under one short lock; the mutex is not reentrant.
        let records = self.records.lock().clone();
        let total = sum_tokens(&records);
        UsageSummary { records, total }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_same_ledger() {
        let ledger = UsageLedger::new();
        let branch = ledger.clone();
        ledger.record("story", "m1", TokenUsage::new(100, 50), 10);
        branch.record("vision", "m2", TokenUsage::new(7, 3), 4);

        let summary = ledger.summary();
        assert_eq!(summary.records.len(), 2);
        assert_eq!(summary.records[1].operation, "vision");
        assert_eq!(summary.total, TokenUsage::new(107, 53));
    }

    #[test]
    fn summary_returns_while_ledger_is_in_use() {
        let ledger = UsageLedger::new();
        ledger.record("placement", "m", TokenUsage::new(1, 2), 3);

        let (tx, rx) = std::sync::mpsc::channel();
        let worker = ledger.clone();
        std::thread::spawn(move || {
            let summary = worker.summary();
            worker.record("refine", "m", TokenUsage::new(4, 5), 6);
            let _ = tx.send((summary, worker.total()));
        });

        let (summary, total) = rx
            .recv_timeout(std::time::Duration::from_secs(3))
            .expect("summary should not block");
        assert_eq!(summary.records.len(), 1);
        assert_eq!(summary.total, TokenUsage::new(1, 2));
        assert_eq!(total, TokenUsage::new(5, 7));
    }
}

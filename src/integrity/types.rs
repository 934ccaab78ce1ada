use serde::{Deserialize, Serialize};

/// How a segment's bytes were obtained during reconstruction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SegmentSource {
    /// A posted copy verified against its hash.
    Copy { redundancy_index: u32 },
    /// Rebuilt from XOR parity.
    Parity,
    /// Rebuilt from Reed-Solomon shards.
    ErasureCode,
    /// Served from the local segment cache, verified when it was stored.
    Cache,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationSummary {
    pub total: usize,
    pub from_copies: usize,
    #[serde(default)]
    pub from_cache: usize,
    pub recovered: usize,
    pub failed_copies: usize,
    pub missing: Vec<u32>,
    pub verified_at: i64,
}

impl VerificationSummary {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            from_copies: 0,
            from_cache: 0,
            recovered: 0,
            failed_copies: 0,
            missing: Vec::new(),
            verified_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn record(&mut self, source: SegmentSource) {
        match source {
            SegmentSource::Copy { .. } => self.from_copies += 1,
            SegmentSource::Cache => self.from_cache += 1,
            SegmentSource::Parity | SegmentSource::ErasureCode => self.recovered += 1,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.missing.is_empty() && self.available() == self.total
    }

    fn available(&self) -> usize {
        self.from_copies + self.from_cache + self.recovered
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.available() as f64 / self.total as f64 * 100.0
    }
}

use bytes::Bytes;
use reed_solomon_erasure::galois_8::ReedSolomon;

use super::error::{Result, SegmentError};

/// Reed-Solomon coder over one group of segments.
pub struct ErasureCoder {
    data_shards: usize,
    parity_shards: usize,
    rs: ReedSolomon,
}

impl ErasureCoder {
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        if data_shards == 0 || parity_shards == 0 {
            return Err(SegmentError::InvalidRedundancy(
                "data and parity shards must be > 0".into(),
            ));
        }
        let rs = ReedSolomon::new(data_shards, parity_shards)
            .map_err(|e| SegmentError::ErasureCoding(e.to_string()))?;
        Ok(Self {
            data_shards,
            parity_shards,
            rs,
        })
    }

    /// Computes parity shards for up to `data_shards` segments. Short groups
    /// (the file's tail) are padded with empty shards.
    pub fn parity(&self, segments: &[Bytes]) -> Result<Vec<Bytes>> {
        if segments.is_empty() {
            return Ok(Vec::new());
        }
        if segments.len() > self.data_shards {
            return Err(SegmentError::ErasureCoding(format!(
                "group of {} exceeds {} data shards",
                segments.len(),
                self.data_shards
            )));
        }

        let shard_size = segments.iter().map(|s| s.len()).max().unwrap_or(0).max(1);
        let mut shards = Vec::with_capacity(self.total_shards());
        for segment in segments {
            let mut shard = segment.to_vec();
            shard.resize(shard_size, 0);
            shards.push(shard);
        }
        shards.resize(self.total_shards(), vec![0u8; shard_size]);

        self.rs
            .encode(&mut shards)
            .map_err(|e| SegmentError::ErasureCoding(e.to_string()))?;

        Ok(shards
            .into_iter()
            .skip(self.data_shards)
            .map(Bytes::from)
            .collect())
    }

    /// Rebuilds the group's data segments.
    ///
    /// `data` holds the group members (`None` where missing) and `parity` the
    /// parity shards in order. `sizes` gives each member's true length so the
    /// zero padding is removed.
    pub fn reconstruct(
        &self,
        data: &[Option<Bytes>],
        parity: &[Option<Bytes>],
        sizes: &[usize],
    ) -> Result<Vec<Bytes>> {
        if data.len() > self.data_shards || data.len() != sizes.len() {
            return Err(SegmentError::ErasureCoding(format!(
                "group shape mismatch: {} members, {} sizes",
                data.len(),
                sizes.len()
            )));
        }

        let shard_size = parity
            .iter()
            .flatten()
            .map(|p| p.len())
            .next()
            .ok_or(SegmentError::InsufficientShards {
                needed: self.data_shards,
                available: data.iter().filter(|d| d.is_some()).count(),
            })?;

        let mut shards: Vec<Option<Vec<u8>>> = Vec::with_capacity(self.total_shards());
        for member in data {
            shards.push(member.as_ref().map(|b| {
                let mut shard = b.to_vec();
                shard.resize(shard_size, 0);
                shard
            }));
        }
        // padding shards of a short group are known zeros
        while shards.len() < self.data_shards {
            shards.push(Some(vec![0u8; shard_size]));
        }
        for i in 0..self.parity_shards {
            shards.push(parity.get(i).cloned().flatten().map(|b| b.to_vec()));
        }

        let present = shards.iter().filter(|s| s.is_some()).count();
        if present < self.data_shards {
            return Err(SegmentError::InsufficientShards {
                needed: self.data_shards,
                available: present,
            });
        }

        self.rs
            .reconstruct_data(&mut shards)
            .map_err(|e| SegmentError::ErasureCoding(e.to_string()))?;

        shards
            .into_iter()
            .take(data.len())
            .zip(sizes)
            .map(|(shard, &size)| {
                let mut shard = shard.ok_or_else(|| {
                    SegmentError::ErasureCoding("shard missing after reconstruction".into())
                })?;
                shard.truncate(size);
                Ok(Bytes::from(shard))
            })
            .collect()
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }
}

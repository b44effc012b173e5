//! Multipart uploads.
//!
//! A transfer declares its parts up front as contiguous `(start, length)`
//! ranges of the target file. Parts are written independently, possibly over
//! several channels, and combined into the target once every byte of every
//! part has been written. Transfers nobody combines or cancels are reclaimed
//! by age.

use super::types::{SftpError, SftpResult};
use dashmap::DashMap;
use kestrel_platform::Clock;
use rand::RngCore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// A part as declared by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartSpec {
    /// Client chosen part id
    pub id: String,
    /// Offset of the part in the target file
    pub start: u64,
    /// Part length in bytes
    pub length: u64,
}

impl PartSpec {
    /// Creates a part declaration.
    pub fn new(id: impl Into<String>, start: u64, length: u64) -> Self {
        Self {
            id: id.into(),
            start,
            length,
        }
    }
}

/// One declared part and the ranges written to it so far.
#[derive(Debug, Clone)]
pub struct Part {
    spec: PartSpec,
    /// Sorted, non-overlapping, non-adjacent written ranges (relative).
    written: Vec<(u64, u64)>,
}

impl Part {
    fn new(spec: PartSpec) -> Self {
        Self {
            spec,
            written: Vec::new(),
        }
    }

    /// Part id.
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    /// Offset in the target file.
    pub fn start(&self) -> u64 {
        self.spec.start
    }

    /// Declared length.
    pub fn length(&self) -> u64 {
        self.spec.length
    }

    /// Bytes written so far, counting overlapping writes once.
    pub fn written(&self) -> u64 {
        self.written.iter().map(|(s, e)| e - s).sum()
    }

    /// Whether every byte has been written.
    pub fn is_complete(&self) -> bool {
        self.written() == self.spec.length
    }

    fn record(&mut self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        let (mut start, mut end) = (offset, offset + len);
        let mut merged = Vec::with_capacity(self.written.len() + 1);
        for &(s, e) in &self.written {
            if e < start || s > end {
                merged.push((s, e));
            } else {
                start = start.min(s);
                end = end.max(e);
            }
        }
        merged.push((start, end));
        merged.sort_unstable();
        self.written = merged;
    }
}

/// An in-progress multipart upload.
#[derive(Debug, Clone)]
pub struct MultipartTransfer {
    id: String,
    path: String,
    parts: Vec<Part>,
    created: Instant,
    clock: Arc<dyn Clock>,
}

impl MultipartTransfer {
    /// Transfer id handed to the client.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Target path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Parts in declared order.
    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// Looks up a part by id.
    pub fn part(&self, id: &str) -> Option<&Part> {
        self.parts.iter().find(|p| p.id() == id)
    }

    /// Index of a part in declared order.
    pub fn part_index(&self, id: &str) -> Option<usize> {
        self.parts.iter().position(|p| p.id() == id)
    }

    /// Size of the combined file.
    pub fn total_length(&self) -> u64 {
        self.parts.iter().map(Part::length).sum()
    }

    /// Whether every part is complete.
    pub fn is_complete(&self) -> bool {
        self.parts.iter().all(Part::is_complete)
    }

    /// Time since creation.
    pub fn age(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.created)
    }
}

/// All open transfers of one server.
#[derive(Debug)]
pub struct MultipartRegistry {
    transfers: DashMap<String, MultipartTransfer>,
    min_part_size: u64,
    clock: Arc<dyn Clock>,
}

impl MultipartRegistry {
    /// Creates a registry. Every part but the last must be at least
    /// `min_part_size` bytes.
    pub fn new(min_part_size: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            transfers: DashMap::new(),
            min_part_size,
            clock,
        }
    }

    /// Minimum size of a non-final part.
    pub fn min_part_size(&self) -> u64 {
        self.min_part_size
    }

    /// Validates the layout and registers a transfer. Nothing is created if
    /// the layout is rejected.
    pub fn create(&self, path: &str, specs: Vec<PartSpec>) -> SftpResult<String> {
        if specs.is_empty() {
            return Err(SftpError::Failure("multipart transfer has no parts".to_string()));
        }
        let last = specs.len() - 1;
        let mut expected = 0u64;
        for (i, spec) in specs.iter().enumerate() {
            if spec.start != expected {
                return Err(SftpError::Failure(format!(
                    "part {} starts at {} but the previous part ends at {}",
                    spec.id, spec.start, expected
                )));
            }
            if i != last && spec.length < self.min_part_size {
                return Err(SftpError::Failure(format!(
                    "part {} is {} bytes; non-final parts must be at least {}",
                    spec.id, spec.length, self.min_part_size
                )));
            }
            if specs[..i].iter().any(|s| s.id == spec.id) {
                return Err(SftpError::Failure(format!("duplicate part id {}", spec.id)));
            }
            expected = expected.checked_add(spec.length).ok_or_else(|| {
                SftpError::Failure("multipart transfer length overflows".to_string())
            })?;
        }

        let id = new_transfer_id();
        let transfer = MultipartTransfer {
            id: id.clone(),
            path: path.to_string(),
            parts: specs.into_iter().map(Part::new).collect(),
            created: self.clock.now(),
            clock: self.clock.clone(),
        };
        info!(
            transfer = %id,
            path = path,
            parts = transfer.parts.len(),
            length = expected,
            "Multipart transfer created"
        );
        self.transfers.insert(id.clone(), transfer);
        Ok(id)
    }

    /// Snapshot of a transfer.
    pub fn get(&self, id: &str) -> Option<MultipartTransfer> {
        self.transfers.get(id).map(|t| t.value().clone())
    }

    /// Returns `(index, length)` of a part of a live transfer.
    pub fn part_bounds(&self, id: &str, part_id: &str) -> SftpResult<(usize, u64)> {
        let transfer = self
            .transfers
            .get(id)
            .ok_or_else(|| SftpError::NotFound(format!("no multipart transfer {}", id)))?;
        let index = transfer
            .part_index(part_id)
            .ok_or_else(|| SftpError::NotFound(format!("no part {} in {}", part_id, id)))?;
        Ok((index, transfer.parts[index].length()))
    }

    /// Checks a write against the part bounds and records it. `offset` is
    /// relative to the part start.
    pub fn record_write(&self, id: &str, part_id: &str, offset: u64, len: u64) -> SftpResult<()> {
        let mut transfer = self
            .transfers
            .get_mut(id)
            .ok_or_else(|| SftpError::NotFound(format!("no multipart transfer {}", id)))?;
        let part = transfer
            .parts
            .iter_mut()
            .find(|p| p.id() == part_id)
            .ok_or_else(|| SftpError::NotFound(format!("no part {} in {}", part_id, id)))?;
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= part.length())
            .ok_or_else(|| {
                SftpError::Failure(format!(
                    "write of {} bytes at {} exceeds part {} length {}",
                    len,
                    offset,
                    part_id,
                    part.length()
                ))
            })?;
        part.record(offset, end - offset);
        Ok(())
    }

    /// Returns a transfer whose parts are all complete. The transfer stays
    /// registered until [`remove`](Self::remove).
    pub fn complete(&self, id: &str) -> SftpResult<MultipartTransfer> {
        let transfer = self
            .transfers
            .get(id)
            .ok_or_else(|| SftpError::NotFound(format!("no multipart transfer {}", id)))?;
        if transfer.is_complete() {
            return Ok(transfer.value().clone());
        }
        let missing: Vec<&str> = transfer
            .parts()
            .iter()
            .filter(|p| !p.is_complete())
            .map(Part::id)
            .collect();
        Err(SftpError::Failure(format!(
            "parts not fully written: {}",
            missing.join(", ")
        )))
    }

    /// Removes a transfer unconditionally.
    pub fn remove(&self, id: &str) -> Option<MultipartTransfer> {
        self.transfers.remove(id).map(|(_, t)| t)
    }

    /// Removes every transfer at least `max_age` old and returns them so
    /// their part data can be discarded.
    pub fn reclaim_older_than(&self, max_age: Duration) -> Vec<MultipartTransfer> {
        let stale: Vec<String> = self
            .transfers
            .iter()
            .filter(|t| t.age() >= max_age)
            .map(|t| t.key().clone())
            .collect();
        let reclaimed: Vec<MultipartTransfer> =
            stale.iter().filter_map(|id| self.remove(id)).collect();
        if !reclaimed.is_empty() {
            debug!(count = reclaimed.len(), "Reclaimed stale multipart transfers");
        }
        reclaimed
    }

    /// Number of live transfers.
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    /// `true` if no transfer is live.
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}

/// Random version 4 UUID in its textual form.
fn new_transfer_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_platform::ManualClock;

    fn registry(min: u64) -> (MultipartRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (MultipartRegistry::new(min, clock.clone()), clock)
    }

    #[test]
    fn test_contiguous_layout_accepted() {
        let (reg, _) = registry(0);
        let id = reg
            .create(
                "/big.bin",
                vec![
                    PartSpec::new("A", 0, 100),
                    PartSpec::new("B", 100, 50),
                    PartSpec::new("C", 150, 75),
                ],
            )
            .unwrap();
        let transfer = reg.get(&id).unwrap();
        assert_eq!(transfer.total_length(), 225);
        assert_eq!(transfer.path(), "/big.bin");
        assert_eq!(reg.part_bounds(&id, "B").unwrap(), (1, 50));
        assert_eq!(id.len(), 36);
        assert_eq!(&id[14..15], "4");
    }

    #[test]
    fn test_overlapping_layout_rejected_without_transfer() {
        let (reg, _) = registry(0);
        let err = reg
            .create(
                "/big.bin",
                vec![PartSpec::new("A", 0, 100), PartSpec::new("B", 90, 50)],
            )
            .unwrap_err();
        assert_eq!(err.code(), 4);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_min_part_size_applies_to_non_final_parts() {
        let (reg, _) = registry(64);
        assert!(reg
            .create("/f", vec![PartSpec::new("A", 0, 10), PartSpec::new("B", 10, 100)])
            .is_err());
        assert!(reg
            .create("/f", vec![PartSpec::new("A", 0, 100), PartSpec::new("B", 100, 10)])
            .is_ok());
    }

    #[test]
    fn test_duplicate_and_empty_layouts_rejected() {
        let (reg, _) = registry(0);
        assert!(reg.create("/f", vec![]).is_err());
        assert!(reg
            .create("/f", vec![PartSpec::new("A", 0, 1), PartSpec::new("A", 1, 1)])
            .is_err());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_completion_tracks_overlapping_writes() {
        let (reg, _) = registry(0);
        let id = reg
            .create("/f", vec![PartSpec::new("A", 0, 10), PartSpec::new("B", 10, 5)])
            .unwrap();
        reg.record_write(&id, "A", 0, 6).unwrap();
        reg.record_write(&id, "A", 4, 6).unwrap();
        reg.record_write(&id, "B", 0, 3).unwrap();
        assert!(reg.complete(&id).is_err());
        assert_eq!(reg.len(), 1);

        reg.record_write(&id, "B", 3, 2).unwrap();
        let transfer = reg.complete(&id).unwrap();
        assert!(transfer.is_complete());
        assert_eq!(reg.len(), 1);
        assert!(reg.remove(&id).is_some());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_write_past_part_end_rejected() {
        let (reg, _) = registry(0);
        let id = reg.create("/f", vec![PartSpec::new("A", 0, 10)]).unwrap();
        assert!(reg.record_write(&id, "A", 8, 3).is_err());
        assert!(reg.record_write(&id, "A", u64::MAX, 2).is_err());
        assert!(reg.record_write(&id, "Z", 0, 1).is_err());
        assert_eq!(reg.get(&id).unwrap().part("A").unwrap().written(), 0);
    }

    #[test]
    fn test_reclaim_by_age() {
        let (reg, clock) = registry(0);
        let old = reg.create("/old", vec![PartSpec::new("A", 0, 1)]).unwrap();
        clock.advance(Duration::from_secs(600));
        let fresh = reg.create("/new", vec![PartSpec::new("A", 0, 1)]).unwrap();
        assert_eq!(reg.get(&old).unwrap().age(), Duration::from_secs(600));

        let reclaimed = reg.reclaim_older_than(Duration::from_secs(300));
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id(), old);
        assert!(reg.get(&fresh).is_some());
    }
}

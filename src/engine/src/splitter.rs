//! Batch splitter: groups a lazy record sequence into fixed-size batches

use bulkflow_shared::ImportRecord;

use crate::error::{EngineError, Result};

/// Accumulates records until `batch_size` is reached, then yields them with
/// a sequential batch index. Construction starts from a caller-supplied
/// index so a resumed job keeps its original numbering.
#[derive(Debug)]
pub struct BatchSplitter {
    batch_size: usize,
    next_index: u64,
    buffer: Vec<ImportRecord>,
}

impl BatchSplitter {
    pub fn new(batch_size: usize, start_index: u64) -> Result<Self> {
        if batch_size < 1 {
            return Err(EngineError::configuration(
                "batch_size must be at least 1",
            ));
        }
        Ok(Self {
            batch_size,
            next_index: start_index,
            buffer: Vec::with_capacity(batch_size),
        })
    }

    /// Add a record; returns a full batch when the size threshold is hit
    pub fn push(&mut self, record: ImportRecord) -> Option<(u64, Vec<ImportRecord>)> {
        self.buffer.push(record);
        if self.buffer.len() >= self.batch_size {
            self.take_buffer()
        } else {
            None
        }
    }

    /// Yield any buffered tail; used at end of stream or at a quota cut
    pub fn flush(&mut self) -> Option<(u64, Vec<ImportRecord>)> {
        if self.buffer.is_empty() {
            None
        } else {
            self.take_buffer()
        }
    }

    /// Index the next yielded batch will carry
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Number of records currently buffered
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn take_buffer(&mut self) -> Option<(u64, Vec<ImportRecord>)> {
        let index = self.next_index;
        self.next_index += 1;
        let records = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));
        Some((index, records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn records(n: u64) -> impl Iterator<Item = ImportRecord> {
        (0..n).map(|i| ImportRecord::pending(i, Default::default()))
    }

    fn split_all(batch_size: usize, n: u64) -> Vec<(u64, Vec<ImportRecord>)> {
        let mut splitter = BatchSplitter::new(batch_size, 0).unwrap();
        let mut batches: Vec<_> = records(n).filter_map(|r| splitter.push(r)).collect();
        if let Some(tail) = splitter.flush() {
            batches.push(tail);
        }
        batches
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        assert!(BatchSplitter::new(0, 0).is_err());
    }

    #[test]
    fn batch_size_one_yields_one_batch_per_record() {
        let batches = split_all(1, 4);
        assert_eq!(batches.len(), 4);
        assert!(batches.iter().all(|(_, records)| records.len() == 1));
    }

    #[test]
    fn exact_multiple_leaves_no_partial_batch() {
        let batches = split_all(5, 15);
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|(_, records)| records.len() == 5));
    }

    #[test]
    fn tail_is_flushed() {
        let batches = split_all(10, 23);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].1.len(), 3);
    }

    #[test]
    fn start_index_offsets_numbering() {
        let mut splitter = BatchSplitter::new(2, 7).unwrap();
        splitter.push(ImportRecord::pending(0, Default::default()));
        let (index, _) = splitter
            .push(ImportRecord::pending(1, Default::default()))
            .unwrap();
        assert_eq!(index, 7);
        assert_eq!(splitter.next_index(), 8);
    }

    proptest! {
        #[test]
        fn batches_partition_the_input(batch_size in 1usize..50, n in 0u64..500) {
            let batches = split_all(batch_size, n);

            let total: usize = batches.iter().map(|(_, r)| r.len()).sum();
            prop_assert_eq!(total as u64, n);

            // Every batch except the last is exactly batch_size.
            if let Some((last, rest)) = batches.split_last() {
                prop_assert!(rest.iter().all(|(_, r)| r.len() == batch_size));
                prop_assert!(!last.1.is_empty());
                prop_assert!(last.1.len() <= batch_size);
            }

            // Indices are sequential from zero and records stay ordered.
            for (expected, (index, records)) in batches.iter().enumerate() {
                prop_assert_eq!(*index, expected as u64);
                let mut prior = None;
                for record in records {
                    if let Some(p) = prior {
                        prop_assert!(record.index > p);
                    }
                    prior = Some(record.index);
                }
            }
        }
    }
}

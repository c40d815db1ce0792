use std::collections::{BTreeSet, HashMap};

#[derive(Debug)]
struct PartitionOffsets {
    in_flight: BTreeSet<i64>,
    /// One past the highest finished offset
    finished_until: i64,
    committed: i64,
}

/// Per-partition bookkeeping for a manually committed consumer whose
/// messages finish out of order. Only the contiguous finished prefix is
/// ever committed, so an offset still in flight (or abandoned unsettled)
/// is consumed again after a restart.
#[derive(Debug, Default)]
pub(crate) struct OffsetTracker {
    partitions: HashMap<(String, i32), PartitionOffsets>,
}

impl OffsetTracker {
    pub(crate) fn track(&mut self, topic: &str, partition: i32, offset: i64) {
        let entry = self
            .partitions
            .entry((topic.to_string(), partition))
            .or_insert_with(|| PartitionOffsets {
                in_flight: BTreeSet::new(),
                finished_until: offset,
                committed: offset,
            });
        entry.in_flight.insert(offset);
    }

    /// Marks `offset` finished. Returns the offset to commit when the
    /// finished prefix of its partition grew.
    pub(crate) fn finish(&mut self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let entry = self.partitions.get_mut(&(topic.to_string(), partition))?;
        if !entry.in_flight.remove(&offset) {
            return None;
        }
        entry.finished_until = entry.finished_until.max(offset + 1);

        let next = entry.in_flight.first().copied().unwrap_or(entry.finished_until);
        if next > entry.committed {
            entry.committed = next;
            Some(next)
        } else {
            None
        }
    }
}

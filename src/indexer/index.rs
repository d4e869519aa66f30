// Bounded, ordered PCR -> stream position index

use super::packet::Pcr;
use gst::ClockTime;
use itertools::Itertools;
use std::collections::VecDeque;
use thiserror::Error;

/// One indexed point of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Unwrapped program clock reference.
    pub pcr: Pcr,
    /// Absolute byte position of the first byte of the PCR-bearing packet.
    pub position: u64,
    pub pid: u16,
    /// The packet had the random access indicator set.
    pub random_access: bool,
}

impl IndexEntry {
    pub fn time(&self) -> ClockTime {
        self.pcr.to_clock_time()
    }
}

/// Retention limits. A zero limit is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bounds {
    pub max_entries: usize,
    pub max_span: Pcr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("entry {pcr} @ {position} does not follow {last_pcr} @ {last_position}")]
pub struct OrderError {
    pub pcr: Pcr,
    pub position: u64,
    pub last_pcr: Pcr,
    pub last_position: u64,
}

#[derive(Debug, Default)]
pub struct Index {
    entries: VecDeque<IndexEntry>,
    bounds: Bounds,
    origin: Option<Pcr>,
}

impl Index {
    pub fn new(bounds: Bounds) -> Self {
        Self {
            entries: VecDeque::new(),
            bounds,
            origin: None,
        }
    }

    /// Applies new limits right away and returns the number of evicted entries.
    pub fn set_bounds(&mut self, bounds: Bounds) -> usize {
        self.bounds = bounds;
        self.evict()
    }

    /// Appends an entry that must be strictly later in both time and
    /// position than the newest one. Returns how many old entries were
    /// evicted to stay within bounds.
    pub fn push(&mut self, entry: IndexEntry) -> Result<usize, OrderError> {
        if let Some(last) = self.entries.back() {
            if entry.pcr <= last.pcr || entry.position <= last.position {
                return Err(OrderError {
                    pcr: entry.pcr,
                    position: entry.position,
                    last_pcr: last.pcr,
                    last_position: last.position,
                });
            }
        }

        self.origin.get_or_insert(entry.pcr);
        self.entries.push_back(entry);
        Ok(self.evict())
    }

    /// Latest entry at or before `target`.
    pub fn lookup(&self, target: Pcr) -> Option<IndexEntry> {
        match self.entries.partition_point(|entry| entry.pcr <= target) {
            0 => None,
            n => Some(self.entries[n - 1]),
        }
    }

    /// PCR of the first entry pushed since the last clear. Eviction keeps it.
    pub fn origin(&self) -> Option<Pcr> {
        self.origin
    }

    pub fn first(&self) -> Option<&IndexEntry> {
        self.entries.front()
    }

    pub fn last(&self) -> Option<&IndexEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.iter()
    }

    /// Time covered between the oldest and newest entry.
    pub fn span(&self) -> Pcr {
        match (self.entries.front(), self.entries.back()) {
            (Some(first), Some(last)) => last.pcr.saturating_sub(first.pcr),
            _ => Pcr::ZERO,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.origin = None;
    }

    pub fn is_ordered(&self) -> bool {
        self.entries
            .iter()
            .tuple_windows()
            .all(|(a, b)| a.pcr < b.pcr && a.position < b.position)
    }

    fn evict(&mut self) -> usize {
        let Bounds {
            max_entries,
            max_span,
        } = self.bounds;
        let before = self.entries.len();

        if max_entries > 0 && self.entries.len() > max_entries {
            let excess = self.entries.len() - max_entries;
            self.entries.drain(..excess);
        }

        if max_span > Pcr::ZERO {
            while self.entries.len() > 1 && self.span() > max_span {
                self.entries.pop_front();
            }
        }

        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use quickcheck_macros::quickcheck;

    fn entry(ticks: u64, position: u64) -> IndexEntry {
        IndexEntry {
            pcr: Pcr::from_ticks(ticks),
            position,
            pid: 0x100,
            random_access: false,
        }
    }

    fn filled(bounds: Bounds, count: u64) -> Index {
        let mut index = Index::new(bounds);
        for i in 1..=count {
            index.push(entry(i * 1000, i * 188)).unwrap();
        }
        index
    }

    #[test]
    fn floor_lookup() {
        let index = filled(Bounds::default(), 5);

        assert_eq!(index.lookup(Pcr::from_ticks(999)), None);
        assert_eq!(index.lookup(Pcr::from_ticks(1000)), Some(entry(1000, 188)));
        assert_eq!(index.lookup(Pcr::from_ticks(2999)), Some(entry(2000, 376)));
        assert_eq!(index.lookup(Pcr::from_ticks(3000)), Some(entry(3000, 564)));
        assert_eq!(index.lookup(Pcr::from_ticks(u64::MAX)), Some(entry(5000, 940)));
    }

    #[test]
    fn empty_lookup() {
        let index = Index::default();
        assert_eq!(index.lookup(Pcr::from_ticks(42)), None);
    }

    #[test]
    fn rejects_out_of_order() {
        let mut index = filled(Bounds::default(), 2);

        assert!(index.push(entry(2000, 1000)).is_err());
        assert!(index.push(entry(3000, 376)).is_err());
        assert_eq!(
            index.push(entry(1500, 1000)).unwrap_err(),
            OrderError {
                pcr: Pcr::from_ticks(1500),
                position: 1000,
                last_pcr: Pcr::from_ticks(2000),
                last_position: 376,
            }
        );
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn count_bound_evicts_oldest() {
        let index = filled(
            Bounds {
                max_entries: 3,
                max_span: Pcr::ZERO,
            },
            10,
        );

        assert_eq!(index.len(), 3);
        assert_eq!(index.first(), Some(&entry(8000, 8 * 188)));
        assert_eq!(index.lookup(Pcr::from_ticks(7999)), None);
    }

    #[test]
    fn origin_survives_eviction_not_clear() {
        let mut index = filled(
            Bounds {
                max_entries: 2,
                max_span: Pcr::ZERO,
            },
            5,
        );
        assert_eq!(index.origin(), Some(Pcr::from_ticks(1000)));

        index.clear();
        assert_eq!(index.origin(), None);

        index.push(entry(50, 10)).unwrap();
        assert_eq!(index.origin(), Some(Pcr::from_ticks(50)));
    }

    #[test]
    fn span_bound_evicts_oldest() {
        let index = filled(
            Bounds {
                max_entries: 0,
                max_span: Pcr::from_ticks(2500),
            },
            10,
        );

        assert_eq!(index.span(), Pcr::from_ticks(2000));
        assert_eq!(index.first(), Some(&entry(8000, 8 * 188)));
    }

    #[test]
    fn tightening_bounds_evicts_immediately() {
        let mut index = filled(Bounds::default(), 10);
        let evicted = index.set_bounds(Bounds {
            max_entries: 4,
            max_span: Pcr::ZERO,
        });

        assert_eq!(evicted, 6);
        assert_eq!(index.len(), 4);
        assert!(index.is_ordered());
    }

    #[quickcheck]
    fn floor_is_latest_not_after_target(steps: Vec<u16>, target: u32, max_entries: u8) -> bool {
        let mut index = Index::new(Bounds {
            max_entries: usize::from(max_entries),
            max_span: Pcr::ZERO,
        });
        let mut ticks = 0u64;
        for (i, step) in steps.iter().enumerate() {
            ticks += u64::from(*step) + 1;
            index.push(entry(ticks, i as u64 * 188)).unwrap();
        }

        let target = Pcr::from_ticks(u64::from(target));
        let expected = index.iter().filter(|e| e.pcr <= target).last().copied();

        let bound = match max_entries {
            0 => steps.len(),
            n => usize::from(n),
        };

        index.len() <= bound && index.lookup(target) == expected
    }
}

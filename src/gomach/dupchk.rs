//! Duplicate detection for retransmitted data frames

use ieee802154::mac::ExtendedAddress;

use super::config::DUPCHK_SIZE;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Record {
    source: ExtendedAddress,
    seq: u8,
    /// Cycles since the source was last seen
    age: u8,
}

/// Fixed capacity cache of the last sequence number seen per source
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DupChecker {
    records: [Option<Record>; DUPCHK_SIZE],
}

impl DupChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check (and record) a received sequence number, only an exact repeat
    /// of the last sequence number from a source is reported as a duplicate
    pub fn is_duplicate(&mut self, source: ExtendedAddress, seq: u8) -> bool {
        if let Some(r) = self.records.iter_mut().flatten().find(|r| r.source == source) {
            r.age = 0;
            if r.seq == seq {
                return true;
            }
            r.seq = seq;
            return false;
        }

        let record = Some(Record { source, seq, age: 0 });

        match self.records.iter().position(|r| r.is_none()) {
            Some(i) => self.records[i] = record,
            None => {
                // Evict the oldest record
                let oldest = self.records.iter().enumerate()
                    .max_by_key(|(_, r)| r.map(|r| r.age).unwrap_or(0))
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                self.records[oldest] = record;
            }
        }

        false
    }

    /// Age all records by one cycle, dropping records older than `lifetime`
    pub fn age(&mut self, lifetime: u8) {
        for r in self.records.iter_mut() {
            if let Some(rec) = r {
                rec.age = rec.age.saturating_add(1);
                if rec.age > lifetime {
                    *r = None;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const A: ExtendedAddress = ExtendedAddress(0xa);

    #[test]
    fn exact_repeat_only() {
        let mut d = DupChecker::new();

        assert!(!d.is_duplicate(A, 5));
        assert!(d.is_duplicate(A, 5));
        assert!(!d.is_duplicate(A, 6));

        // Skipped sequence numbers are new frames
        assert!(!d.is_duplicate(A, 9));
        assert!(d.is_duplicate(A, 9));

        // Sources are tracked independently
        assert!(!d.is_duplicate(ExtendedAddress(0xb), 9));
    }

    #[test]
    fn records_expire() {
        let mut d = DupChecker::new();
        d.is_duplicate(A, 1);

        for _ in 0..3 {
            d.age(3);
        }
        assert_eq!(d.len(), 1);

        // Seeing the source again resets its age
        assert!(d.is_duplicate(A, 1));
        d.age(3);
        assert_eq!(d.len(), 1);

        for _ in 0..3 {
            d.age(3);
        }
        assert!(d.is_empty());
        assert!(!d.is_duplicate(A, 1));
    }

    #[test]
    fn full_cache_evicts_oldest() {
        let mut d = DupChecker::new();

        d.is_duplicate(ExtendedAddress(100), 0);
        d.age(30);

        for i in 0..DUPCHK_SIZE as u64 - 1 {
            d.is_duplicate(ExtendedAddress(i), 0);
        }
        assert_eq!(d.len(), DUPCHK_SIZE);

        // New source replaces the oldest record
        assert!(!d.is_duplicate(ExtendedAddress(200), 0));
        assert!(d.is_duplicate(ExtendedAddress(200), 0));
        assert!(!d.is_duplicate(ExtendedAddress(100), 0));
        assert!(d.is_duplicate(ExtendedAddress(1), 0));
    }
}

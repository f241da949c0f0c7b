//! Coordinate index: span-compressed id -> coordinate store with batched
//! ordered lookup, built from a monotonically increasing stream of
//! `(id, (x, y))` pairs.

mod builder;
mod reader;

pub use builder::{BuiltCoordIndex, CoordIndexBuilder};
pub use reader::CoordIndexReader;

pub type NodeId = u64;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::FixedXy;

    #[test]
    fn single_push_roundtrip() {
        let mut b = CoordIndexBuilder::new();
        b.push(42, FixedXy::new(2, 3)).unwrap();
        let r = b.finish().into_reader();
        assert_eq!(r.get(42).unwrap(), Some(FixedXy::new(2, 3)));
        assert_eq!(r.get(41).unwrap(), None);
        assert_eq!(r.get(43).unwrap(), None);
    }

    #[test]
    fn contiguous_run_roundtrip() {
        let mut b = CoordIndexBuilder::new();
        for id in 1..=2000u64 {
            b.push(id, FixedXy::new(id as i64 * 10, id as i64 * 20))
                .unwrap();
        }
        let r = b.finish().into_reader();
        for id in [1u64, 500, 999, 1000, 1500, 2000] {
            assert_eq!(
                r.get(id).unwrap(),
                Some(FixedXy::new(id as i64 * 10, id as i64 * 20))
            );
        }
        assert_eq!(r.get(2001).unwrap(), None);
    }

    #[test]
    fn long_contiguous_run_gets_multiple_index_strides() {
        let mut b = CoordIndexBuilder::new();
        for id in 1..=10_000u64 {
            b.push(id, FixedXy::new(id as i64, id as i64)).unwrap();
        }
        let built = b.finish();
        assert!(built.idx.len() > 1, "a 10k-id contiguous run should span several index strides");
        let r = built.into_reader();
        for id in [1u64, 1023, 1024, 5000, 9999, 10_000] {
            assert_eq!(r.get(id).unwrap(), Some(FixedXy::new(id as i64, id as i64)));
        }
    }

    #[test]
    fn gaps_produce_empty_spans() {
        let mut b = CoordIndexBuilder::new();
        b.push(1, FixedXy::new(1, 1)).unwrap();
        b.push(2, FixedXy::new(2, 2)).unwrap();
        b.push(100, FixedXy::new(100, 100)).unwrap();
        b.push(101, FixedXy::new(101, 101)).unwrap();
        let r = b.finish().into_reader();
        assert_eq!(r.get(1).unwrap(), Some(FixedXy::new(1, 1)));
        assert_eq!(r.get(2).unwrap(), Some(FixedXy::new(2, 2)));
        assert_eq!(r.get(50).unwrap(), None);
        assert_eq!(r.get(100).unwrap(), Some(FixedXy::new(100, 100)));
        assert_eq!(r.get(101).unwrap(), Some(FixedXy::new(101, 101)));
    }

    #[test]
    fn batched_lookup_matches_single() {
        let mut b = CoordIndexBuilder::new();
        for id in (1..=5000u64).step_by(3) {
            b.push(id, FixedXy::new(id as i64, id as i64 * 2)).unwrap();
        }
        let r = b.finish().into_reader();
        let ids: Vec<u64> = (1..=5000).collect();
        let batch = r.get_batch(&ids).unwrap();
        for (id, got) in ids.iter().zip(batch.iter()) {
            assert_eq!(*got, r.get(*id).unwrap());
        }
    }

    #[test]
    fn push_requires_increasing_ids() {
        let mut b = CoordIndexBuilder::new();
        b.push(5, FixedXy::new(0, 0)).unwrap();
        assert!(b.push(5, FixedXy::new(1, 1)).is_err());
        assert!(b.push(4, FixedXy::new(1, 1)).is_err());
    }
}

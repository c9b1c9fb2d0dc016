//! Contiguous arcs of the 128-bit ring.
//!
//! An interval is constructed from explicit open/closed bounds but normalised
//! internally to a half-open `[x, y)` arc, which is exact because keys are
//! integers. Arcs wrap around zero when `y <= x`. The whole ring and the empty
//! set are distinct variants, so the `Arc` representation is canonical and
//! structural equality is set equality.

use serde::{Deserialize, Serialize};

use crate::keys::{Quadrant, RingKey, QUADRANT_SPAN};

/// Whether an interval bound includes its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bound {
    /// `(` or `)`: the bound key is excluded.
    Open,
    /// `[` or `]`: the bound key is included.
    Closed,
}

/// A contiguous arc of the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    /// The empty set.
    Empty,
    /// The whole ring.
    Full,
    /// The half-open arc `[x, y)`, clockwise, wrapping through zero when
    /// `y <= x`. Invariant: `x != y`.
    Arc {
        /// First key of the arc.
        x: RingKey,
        /// First key past the arc.
        y: RingKey,
    },
}

/// A linear segment `[start, end)` of the unrolled ring; `end == None` means
/// 2^128. Intermediate representation for the set operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    start: u128,
    end: Option<u128>,
}

impl Interval {
    /// The empty interval.
    pub const fn empty() -> Self {
        Interval::Empty
    }

    /// The whole ring.
    pub const fn full() -> Self {
        Interval::Full
    }

    /// Construct from explicit bounds, travelling clockwise from `lo` to `hi`.
    ///
    /// Zero travel is taken literally: `[a, a]` is the single key `a`, while
    /// `(a, a)`, `[a, a)` and `(a, a]` are empty. The whole ring is spelled
    /// [`Interval::full`] (or closed bounds with `hi == lo - 1`).
    pub fn new(left: Bound, lo: RingKey, hi: RingKey, right: Bound) -> Self {
        let steps = lo.distance_to(hi);
        let opens = (left == Bound::Open) as u32 + (right == Bound::Open) as u32;
        let empty = match opens {
            0 => false,
            1 => steps == 0,
            _ => steps <= 1,
        };
        if empty {
            return Interval::Empty;
        }
        if opens == 0 && steps == u128::MAX {
            return Interval::Full;
        }
        let x = match left {
            Bound::Closed => lo,
            Bound::Open => lo.wrapping_add(1),
        };
        let y = match right {
            Bound::Closed => hi.wrapping_add(1),
            Bound::Open => hi,
        };
        debug_assert_ne!(x, y);
        Interval::Arc { x, y }
    }

    /// The half-open arc `[x, y)`.
    pub fn range(x: RingKey, y: RingKey) -> Self {
        if x == y {
            Interval::Empty
        } else {
            Interval::Arc { x, y }
        }
    }

    /// The interval holding exactly `key`.
    pub fn point(key: RingKey) -> Self {
        Interval::Arc {
            x: key,
            y: key.wrapping_add(1),
        }
    }

    /// The arc covered by quadrant `q`.
    pub fn quadrant(q: Quadrant) -> Self {
        let x = q.first_key();
        Interval::Arc {
            x,
            y: x.wrapping_add(QUADRANT_SPAN),
        }
    }

    /// Whether this interval contains no keys.
    pub fn is_empty(&self) -> bool {
        matches!(self, Interval::Empty)
    }

    /// Whether `key` lies inside this interval.
    pub fn contains(&self, key: RingKey) -> bool {
        match self {
            Interval::Empty => false,
            Interval::Full => true,
            Interval::Arc { x, y } => {
                if x < y {
                    *x <= key && key < *y
                } else {
                    key >= *x || key < *y
                }
            }
        }
    }

    /// Number of keys covered. Saturates at `u128::MAX` for the full ring.
    pub fn size(&self) -> u128 {
        match self {
            Interval::Empty => 0,
            Interval::Full => u128::MAX,
            Interval::Arc { x, y } => x.distance_to(*y),
        }
    }

    /// Intersection with `other`. Two wrapping arcs can intersect in two
    /// disjoint runs, hence the list result.
    pub fn intersection(&self, other: &Interval) -> Vec<Interval> {
        let mut out = Vec::new();
        for a in self.to_segments() {
            for b in other.to_segments() {
                let start = a.start.max(b.start);
                let end = match (a.end, b.end) {
                    (Some(ae), Some(be)) => Some(ae.min(be)),
                    (Some(ae), None) => Some(ae),
                    (None, Some(be)) => Some(be),
                    (None, None) => None,
                };
                let nonempty = match end {
                    Some(e) => start < e,
                    None => true,
                };
                if nonempty {
                    out.push(Segment { start, end });
                }
            }
        }
        Self::from_segments(out)
    }

    /// Union with `other`, as a list of disjoint arcs (merged where
    /// contiguous).
    pub fn union(&self, other: &Interval) -> Vec<Interval> {
        let mut segs = self.to_segments();
        segs.extend(other.to_segments());
        Self::from_segments(segs)
    }

    /// The keys of `self` not in `other`, as a list of disjoint arcs.
    pub fn difference(&self, other: &Interval) -> Vec<Interval> {
        let mut out = Vec::new();
        for seg in Self::complement_segments(other) {
            for a in self.to_segments() {
                let start = a.start.max(seg.start);
                let end = match (a.end, seg.end) {
                    (Some(ae), Some(be)) => Some(ae.min(be)),
                    (Some(ae), None) => Some(ae),
                    (None, Some(be)) => Some(be),
                    (None, None) => None,
                };
                let nonempty = match end {
                    Some(e) => start < e,
                    None => true,
                };
                if nonempty {
                    out.push(Segment { start, end });
                }
            }
        }
        Self::from_segments(out)
    }

    /// Equi-partition into `n` arcs, in ring order. Sub-arc sizes differ by at
    /// most one; trailing entries are empty when the interval holds fewer than
    /// `n` keys.
    pub fn partition(&self, n: usize) -> Vec<Interval> {
        assert!(n > 0, "partition into zero arcs");
        match self {
            Interval::Empty => vec![Interval::Empty; n],
            Interval::Full => {
                if n == 1 {
                    return vec![Interval::Full];
                }
                // floor(2^128 / n), computed without overflowing u128
                let q = u128::MAX / n as u128;
                let r = u128::MAX % n as u128;
                let step = if r + 1 == n as u128 { q + 1 } else { q };
                let mut out = Vec::with_capacity(n);
                let mut x = RingKey::ZERO;
                for i in 0..n {
                    let y = if i == n - 1 {
                        RingKey::ZERO
                    } else {
                        x.wrapping_add(step)
                    };
                    out.push(Interval::Arc { x, y });
                    x = y;
                }
                out
            }
            Interval::Arc { x, y } => {
                let span = x.distance_to(*y);
                let step = span / n as u128;
                let rem = span % n as u128;
                let mut out = Vec::with_capacity(n);
                let mut lo = *x;
                for i in 0..n {
                    let len = step + ((i as u128) < rem) as u128;
                    if len == 0 {
                        out.push(Interval::Empty);
                        continue;
                    }
                    let hi = lo.wrapping_add(len);
                    out.push(Interval::Arc { x: lo, y: hi });
                    lo = hi;
                }
                out
            }
        }
    }

    /// Rotate the interval from quadrant `from` to quadrant `to`.
    pub fn translate(&self, from: Quadrant, to: Quadrant) -> Interval {
        match self {
            Interval::Empty => Interval::Empty,
            Interval::Full => Interval::Full,
            Interval::Arc { x, y } => Interval::Arc {
                x: x.translate(from, to),
                y: y.translate(from, to),
            },
        }
    }

    /// Draw a uniformly random key from the interval.
    pub fn random_key<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Option<RingKey> {
        match self {
            Interval::Empty => None,
            Interval::Full => Some(RingKey::new(rng.gen())),
            Interval::Arc { x, y } => {
                let span = x.distance_to(*y);
                Some(x.wrapping_add(rng.gen_range(0..span)))
            }
        }
    }

    fn to_segments(&self) -> Vec<Segment> {
        match self {
            Interval::Empty => vec![],
            Interval::Full => vec![Segment {
                start: 0,
                end: None,
            }],
            Interval::Arc { x, y } => {
                let (x, y) = (x.value(), y.value());
                if x < y {
                    vec![Segment {
                        start: x,
                        end: Some(y),
                    }]
                } else {
                    let mut segs = vec![Segment {
                        start: x,
                        end: None,
                    }];
                    if y > 0 {
                        segs.insert(
                            0,
                            Segment {
                                start: 0,
                                end: Some(y),
                            },
                        );
                    }
                    segs
                }
            }
        }
    }

    fn complement_segments(interval: &Interval) -> Vec<Segment> {
        let segs = match interval {
            Interval::Empty => {
                return vec![Segment {
                    start: 0,
                    end: None,
                }]
            }
            Interval::Full => return vec![],
            _ => Self::merge_segments(interval.to_segments()),
        };
        let mut out = Vec::new();
        let mut cursor = 0u128;
        for seg in &segs {
            if seg.start > cursor {
                out.push(Segment {
                    start: cursor,
                    end: Some(seg.start),
                });
            }
            match seg.end {
                Some(e) => cursor = e,
                None => return out,
            }
        }
        out.push(Segment {
            start: cursor,
            end: None,
        });
        out
    }

    fn merge_segments(mut segs: Vec<Segment>) -> Vec<Segment> {
        segs.sort_by_key(|s| s.start);
        let mut merged: Vec<Segment> = Vec::with_capacity(segs.len());
        for seg in segs {
            match merged.last_mut() {
                Some(last) => match last.end {
                    // a segment reaching 2^128 subsumes everything after it
                    None => break,
                    Some(last_end) if last_end >= seg.start => {
                        last.end = seg.end.map(|e| last_end.max(e));
                    }
                    _ => merged.push(seg),
                },
                None => merged.push(seg),
            }
        }
        merged
    }

    fn from_segments(segs: Vec<Segment>) -> Vec<Interval> {
        let mut merged = Self::merge_segments(segs);
        if merged.is_empty() {
            return vec![];
        }
        // Stitch the seam: a run ending at 2^128 continues into a run starting
        // at zero, forming a wrapping arc.
        if merged.len() >= 2 && merged[0].start == 0 && merged.last().unwrap().end.is_none() {
            let tail = merged.pop().unwrap();
            let head = merged.remove(0);
            let head_end = head.end.expect("non-full head segment");
            if tail.start == head_end {
                return vec![Interval::Full];
            }
            let mut out = vec![Interval::Arc {
                x: RingKey::new(tail.start),
                y: RingKey::new(head_end),
            }];
            out.extend(merged.into_iter().map(Self::segment_to_interval));
            return out;
        }
        merged.into_iter().map(Self::segment_to_interval).collect()
    }

    fn segment_to_interval(seg: Segment) -> Interval {
        match seg.end {
            None if seg.start == 0 => Interval::Full,
            None => Interval::Arc {
                x: RingKey::new(seg.start),
                y: RingKey::ZERO,
            },
            Some(e) => Interval::Arc {
                x: RingKey::new(seg.start),
                y: RingKey::new(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand_core::SeedableRng;

    use super::*;

    fn key(v: u128) -> RingKey {
        RingKey::new(v)
    }

    #[test]
    fn bound_normalisation() {
        let point = Interval::new(Bound::Closed, key(5), key(5), Bound::Closed);
        assert_eq!(point, Interval::point(key(5)));
        assert!(point.contains(key(5)));
        assert_eq!(point.size(), 1);

        assert!(Interval::new(Bound::Open, key(5), key(5), Bound::Open).is_empty());
        assert!(Interval::new(Bound::Closed, key(5), key(5), Bound::Open).is_empty());
        assert!(Interval::new(Bound::Open, key(5), key(6), Bound::Open).is_empty());

        let full = Interval::new(Bound::Closed, key(5), key(4), Bound::Closed);
        assert_eq!(full, Interval::Full);

        let arc = Interval::new(Bound::Open, key(5), key(9), Bound::Closed);
        assert_eq!(arc, Interval::range(key(6), key(10)));
    }

    #[test]
    fn contains_wrapping() {
        let arc = Interval::range(key(u128::MAX - 1), key(2));
        assert!(arc.contains(key(u128::MAX)));
        assert!(arc.contains(key(0)));
        assert!(arc.contains(key(1)));
        assert!(!arc.contains(key(2)));
        assert!(!arc.contains(key(100)));
        assert_eq!(arc.size(), 4);
    }

    #[test]
    fn quadrant_arcs_partition_the_ring() {
        let parts = Interval::Full.partition(4);
        assert_eq!(parts.len(), 4);
        for (q, part) in Quadrant::ALL.iter().zip(&parts) {
            assert_eq!(*part, Interval::quadrant(*q));
            assert_eq!(part.size(), QUADRANT_SPAN);
        }
        // adjacent and disjoint
        for pair in parts.windows(2) {
            assert!(pair[0].intersection(&pair[1]).is_empty());
        }
    }

    #[test]
    fn partition_covers_arc() {
        let arc = Interval::range(key(10), key(23));
        let parts = arc.partition(4);
        assert_eq!(parts.len(), 4);
        let total: u128 = parts.iter().map(|p| p.size()).sum();
        assert_eq!(total, arc.size());
        // sizes differ by at most one
        let sizes: Vec<u128> = parts.iter().map(|p| p.size()).collect();
        assert!(sizes.iter().max().unwrap() - sizes.iter().min().unwrap() <= 1);
        // recombining yields the original arc
        let mut union = vec![parts[0]];
        for p in &parts[1..] {
            union = union[0].union(p);
            assert_eq!(union.len(), 1);
        }
        assert_eq!(union[0], arc);
    }

    #[test]
    fn intersection_and_difference() {
        let a = Interval::range(key(10), key(30));
        let b = Interval::range(key(20), key(40));
        assert_eq!(a.intersection(&b), vec![Interval::range(key(20), key(30))]);
        assert_eq!(a.difference(&b), vec![Interval::range(key(10), key(20))]);
        assert_eq!(
            a.union(&b),
            vec![Interval::range(key(10), key(40))]
        );

        let disjoint = Interval::range(key(50), key(60));
        assert!(a.intersection(&disjoint).is_empty());
        assert_eq!(a.union(&disjoint).len(), 2);
    }

    #[test]
    fn wrapping_set_ops() {
        // both arcs wrap; intersection has two runs
        let a = Interval::range(key(u128::MAX - 10), key(20));
        let b = Interval::range(key(u128::MAX - 5), key(30));
        let both = a.intersection(&b);
        assert_eq!(
            both,
            vec![Interval::range(key(u128::MAX - 5), key(20))]
        );

        // c covers all but [50, 100); d sits at the end of c's lower run
        let c = Interval::range(key(100), key(50));
        let d = Interval::range(key(40), key(50));
        assert_eq!(c.intersection(&d), vec![d]);

        // complement round trip
        let diff = Interval::Full.difference(&a);
        assert_eq!(diff, vec![Interval::range(key(20), key(u128::MAX - 10))]);
    }

    #[test]
    fn union_stitches_the_seam() {
        let a = Interval::range(key(u128::MAX - 5), key(0));
        let b = Interval::range(key(0), key(5));
        assert_eq!(
            a.union(&b),
            vec![Interval::range(key(u128::MAX - 5), key(5))]
        );
    }

    #[test]
    fn translate_round_trip() {
        let arc = Interval::range(key(QUADRANT_SPAN + 3), key(QUADRANT_SPAN + 90));
        let moved = arc.translate(Quadrant::ALL[1], Quadrant::ALL[3]);
        assert_eq!(moved.size(), arc.size());
        assert_eq!(moved.translate(Quadrant::ALL[3], Quadrant::ALL[1]), arc);
    }

    #[test]
    fn random_key_is_member() {
        let mut rng = StdRng::seed_from_u64(7);
        let arc = Interval::range(key(u128::MAX - 3), key(4));
        for _ in 0..100 {
            let k = arc.random_key(&mut rng).unwrap();
            assert!(arc.contains(k));
        }
        assert!(Interval::Empty.random_key(&mut rng).is_none());
    }
}

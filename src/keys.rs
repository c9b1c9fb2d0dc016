//! Ring key arithmetic for the replicated key space.
//!
//! The key space is the ring of unsigned 128-bit integers, i.e. all arithmetic
//! is mod 2^128. The ring is divided into four equal arcs called *quadrants*;
//! every logical key has one replica in each quadrant, at offsets of a quarter
//! turn.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of replicas of each logical key. One replica lives in each quadrant.
pub const REPLICATION_FACTOR: u8 = 4;

/// Width of one quadrant: a quarter of the 2^128 key space.
pub const QUADRANT_SPAN: u128 = 1 << 126;

/// A position on the 128-bit ring.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RingKey(u128);

impl RingKey {
    /// The zero key.
    pub const ZERO: Self = RingKey(0);

    /// Create a key from its integer value.
    pub const fn new(value: u128) -> Self {
        RingKey(value)
    }

    /// The integer value of this key.
    pub const fn value(self) -> u128 {
        self.0
    }

    /// Ring addition, wrapping at 2^128.
    pub fn wrapping_add(self, rhs: u128) -> Self {
        RingKey(self.0.wrapping_add(rhs))
    }

    /// Ring subtraction, wrapping at 2^128.
    pub fn wrapping_sub(self, rhs: u128) -> Self {
        RingKey(self.0.wrapping_sub(rhs))
    }

    /// Clockwise distance from `self` to `other`.
    pub fn distance_to(self, other: RingKey) -> u128 {
        other.0.wrapping_sub(self.0)
    }

    /// The quadrant this key falls into.
    pub fn quadrant(self) -> Quadrant {
        Quadrant((self.0 >> 126) as u8)
    }

    /// The replica of this key in quadrant `q`, relative to quadrant zero.
    ///
    /// For a key in quadrant zero this yields the `q`-th member of its replica
    /// group; see [`RingKey::translate`] for mapping between arbitrary
    /// quadrants.
    pub fn replica(self, q: Quadrant) -> RingKey {
        self.wrapping_add(q.0 as u128 * QUADRANT_SPAN)
    }

    /// The canonical quadrant-zero representative of this key's replica group.
    pub fn base(self) -> RingKey {
        self.translate(self.quadrant(), Quadrant(0))
    }

    /// All four members of this key's replica group, starting at the
    /// quadrant-zero representative.
    pub fn replica_group(self) -> [RingKey; REPLICATION_FACTOR as usize] {
        let base = self.base();
        [
            base,
            base.replica(Quadrant(1)),
            base.replica(Quadrant(2)),
            base.replica(Quadrant(3)),
        ]
    }

    /// Map this key from quadrant `from` to the corresponding position in
    /// quadrant `to`, keeping the offset within the quadrant.
    pub fn translate(self, from: Quadrant, to: Quadrant) -> RingKey {
        let delta = (to.0 as u128).wrapping_sub(from.0 as u128) & 0b11;
        self.wrapping_add(delta * QUADRANT_SPAN)
    }
}

impl From<u128> for RingKey {
    fn from(value: u128) -> Self {
        RingKey(value)
    }
}

impl fmt::Display for RingKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for RingKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let hex = format!("{:032x}", self.0);
        write!(f, "Key({}…{})", &hex[..6], &hex[hex.len() - 2..])
    }
}

/// One of the four equal arcs of the ring.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Quadrant(u8);

impl Quadrant {
    /// The quadrant of the canonical replica-group representatives.
    pub const ZERO: Quadrant = Quadrant(0);

    /// All quadrants, in ring order.
    pub const ALL: [Quadrant; REPLICATION_FACTOR as usize] =
        [Quadrant(0), Quadrant(1), Quadrant(2), Quadrant(3)];

    /// Create a quadrant from its index. Fails for indices >= 4.
    pub fn new(index: u8) -> Option<Quadrant> {
        (index < REPLICATION_FACTOR).then_some(Quadrant(index))
    }

    /// The index of this quadrant.
    pub const fn index(self) -> u8 {
        self.0
    }

    /// The quadrant that undoes this one: `k.replica(q).replica(q.inverse()) == k`.
    pub fn inverse(self) -> Quadrant {
        Quadrant((REPLICATION_FACTOR - self.0) % REPLICATION_FACTOR)
    }

    /// The first key of this quadrant.
    pub fn first_key(self) -> RingKey {
        RingKey(self.0 as u128 * QUADRANT_SPAN)
    }

    /// The three quadrants other than this one.
    pub fn others(self) -> impl Iterator<Item = Quadrant> {
        Quadrant::ALL.into_iter().filter(move |q| *q != self)
    }
}

impl fmt::Display for Quadrant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

impl fmt::Debug for Quadrant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Quadrant({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replica_round_trip() {
        let keys = [0u128, 1, QUADRANT_SPAN - 1, QUADRANT_SPAN, u128::MAX];
        for value in keys {
            let k = RingKey::new(value);
            for q in Quadrant::ALL {
                assert_eq!(k.replica(q).replica(q.inverse()), k, "key {k} quadrant {q}");
            }
        }
    }

    #[test]
    fn quadrant_of_replica() {
        let k = RingKey::new(42);
        assert_eq!(k.quadrant(), Quadrant(0));
        assert_eq!(k.replica(Quadrant(1)).quadrant(), Quadrant(1));
        assert_eq!(k.replica(Quadrant(3)).quadrant(), Quadrant(3));
    }

    #[test]
    fn base_is_quadrant_zero() {
        let k = RingKey::new(3 * QUADRANT_SPAN + 17);
        assert_eq!(k.base(), RingKey::new(17));
        assert_eq!(k.base().quadrant(), Quadrant(0));
        assert_eq!(RingKey::new(17).base(), RingKey::new(17));
    }

    #[test]
    fn translate_between_quadrants() {
        let k = RingKey::new(2 * QUADRANT_SPAN + 5);
        let moved = k.translate(Quadrant(2), Quadrant(1));
        assert_eq!(moved, RingKey::new(QUADRANT_SPAN + 5));
        assert_eq!(moved.translate(Quadrant(1), Quadrant(2)), k);
    }

    #[test]
    fn replica_group_members() {
        let k = RingKey::new(QUADRANT_SPAN + 7);
        let group = k.replica_group();
        assert_eq!(group[0], RingKey::new(7));
        assert!(group.contains(&k));
        for (i, member) in group.iter().enumerate() {
            assert_eq!(member.quadrant().index() as usize, i);
        }
    }
}

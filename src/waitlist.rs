//! Deadline-ordered sets of sequence numbers awaiting retransmission. Both implementations order
//!  by deadline, with ties broken by insertion order. A sequence number is in the waitlist at most
//!  once: adding it again replaces its deadline.

use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use tokio::time::Instant;

pub trait Waitlist: Send {
    fn add(&mut self, seq: i32, deadline: Instant);

    /// removing a sequence number that is not in the waitlist has no effect
    fn remove(&mut self, seq: i32);

    fn next_deadline(&self) -> Option<Instant>;

    /// removes and returns the earliest entry if its deadline is not after `now`
    fn pop_due(&mut self, now: Instant) -> Option<i32>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self);
}

/// Picks the implementation suitable for the expected number of waiting messages: a sorted array
///  for short waitlists, a tree when the waitlist is expected to be longer than `tree_len`.
pub fn new_waitlist(expected_len: usize, tree_len: usize) -> Box<dyn Waitlist> {
    if expected_len > tree_len {
        Box::new(TreeWaitlist::default())
    }
    else {
        Box::new(ArrayWaitlist::default())
    }
}

/// Sorted by deadline, earliest first
#[derive(Default)]
pub struct ArrayWaitlist {
    entries: Vec<(Instant, i32)>,
}

impl Waitlist for ArrayWaitlist {
    fn add(&mut self, seq: i32, deadline: Instant) {
        self.remove(seq);
        let idx = self.entries.partition_point(|(d, _)| *d <= deadline);
        self.entries.insert(idx, (deadline, seq));
    }

    fn remove(&mut self, seq: i32) {
        if let Some(idx) = self.entries.iter().position(|(_, s)| *s == seq) {
            self.entries.remove(idx);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.entries.first().map(|(d, _)| *d)
    }

    fn pop_due(&mut self, now: Instant) -> Option<i32> {
        match self.entries.first() {
            Some((deadline, _)) if *deadline <= now => Some(self.entries.remove(0).1),
            _ => None,
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Ordered by (deadline, insertion counter), with an index by sequence number for removal
#[derive(Default)]
pub struct TreeWaitlist {
    by_deadline: BTreeMap<(Instant, u64), i32>,
    by_seq: FxHashMap<i32, (Instant, u64)>,
    insertion_counter: u64,
}

impl Waitlist for TreeWaitlist {
    fn add(&mut self, seq: i32, deadline: Instant) {
        self.remove(seq);
        let key = (deadline, self.insertion_counter);
        self.insertion_counter += 1;
        self.by_deadline.insert(key, seq);
        self.by_seq.insert(seq, key);
    }

    fn remove(&mut self, seq: i32) {
        if let Some(key) = self.by_seq.remove(&seq) {
            self.by_deadline.remove(&key);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.by_deadline.keys().next().map(|(d, _)| *d)
    }

    fn pop_due(&mut self, now: Instant) -> Option<i32> {
        let entry = self.by_deadline.first_entry()?;
        if entry.key().0 > now {
            return None;
        }
        let seq = entry.remove();
        self.by_seq.remove(&seq);
        Some(seq)
    }

    fn len(&self) -> usize {
        self.by_seq.len()
    }

    fn clear(&mut self) {
        self.by_deadline.clear();
        self.by_seq.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::time::Duration;

    fn at(base: Instant, millis: u64) -> Instant {
        base + Duration::from_millis(millis)
    }

    fn drain(waitlist: &mut dyn Waitlist, now: Instant) -> Vec<i32> {
        let mut result = vec![];
        while let Some(seq) = waitlist.pop_due(now) {
            result.push(seq);
        }
        result
    }

    #[rstest]
    #[case::array(Box::new(ArrayWaitlist::default()))]
    #[case::tree(Box::new(TreeWaitlist::default()))]
    fn test_order_by_deadline_then_insertion(#[case] mut waitlist: Box<dyn Waitlist>) {
        let base = Instant::now();
        waitlist.add(1, at(base, 30));
        waitlist.add(2, at(base, 10));
        waitlist.add(3, at(base, 20));
        waitlist.add(4, at(base, 10));
        waitlist.add(5, at(base, 20));

        assert_eq!(waitlist.len(), 5);
        assert_eq!(waitlist.next_deadline(), Some(at(base, 10)));
        assert_eq!(drain(waitlist.as_mut(), at(base, 9)), Vec::<i32>::new());
        assert_eq!(drain(waitlist.as_mut(), at(base, 20)), vec![2, 4, 3, 5]);
        assert_eq!(drain(waitlist.as_mut(), at(base, 100)), vec![1]);
        assert!(waitlist.is_empty());
        assert_eq!(waitlist.next_deadline(), None);
    }

    #[rstest]
    #[case::array(Box::new(ArrayWaitlist::default()))]
    #[case::tree(Box::new(TreeWaitlist::default()))]
    fn test_remove_is_idempotent(#[case] mut waitlist: Box<dyn Waitlist>) {
        let base = Instant::now();
        waitlist.add(1, at(base, 10));
        waitlist.add(2, at(base, 20));

        waitlist.remove(1);
        waitlist.remove(1);
        waitlist.remove(99);

        assert_eq!(waitlist.len(), 1);
        assert_eq!(waitlist.next_deadline(), Some(at(base, 20)));
        assert_eq!(drain(waitlist.as_mut(), at(base, 100)), vec![2]);
    }

    #[rstest]
    #[case::array(Box::new(ArrayWaitlist::default()))]
    #[case::tree(Box::new(TreeWaitlist::default()))]
    fn test_add_replaces_deadline(#[case] mut waitlist: Box<dyn Waitlist>) {
        let base = Instant::now();
        waitlist.add(1, at(base, 10));
        waitlist.add(2, at(base, 20));
        waitlist.add(1, at(base, 30));

        assert_eq!(waitlist.len(), 2);
        assert_eq!(drain(waitlist.as_mut(), at(base, 100)), vec![2, 1]);
    }

    #[rstest]
    #[case::array(Box::new(ArrayWaitlist::default()))]
    #[case::tree(Box::new(TreeWaitlist::default()))]
    fn test_clear(#[case] mut waitlist: Box<dyn Waitlist>) {
        let base = Instant::now();
        waitlist.add(1, at(base, 10));
        waitlist.add(2, at(base, 20));
        waitlist.clear();

        assert!(waitlist.is_empty());
        assert_eq!(waitlist.pop_due(at(base, 100)), None);
    }

    #[test]
    fn test_implementations_agree() {
        use rand::{Rng, SeedableRng};
        use rand::rngs::StdRng;

        let base = Instant::now();
        let mut rng = StdRng::seed_from_u64(4711);
        let mut array = ArrayWaitlist::default();
        let mut tree = TreeWaitlist::default();

        for _ in 0..2000 {
            let seq = rng.gen_range(0..200);
            match rng.gen_range(0..3) {
                0 => {
                    array.remove(seq);
                    tree.remove(seq);
                }
                _ => {
                    let deadline = at(base, rng.gen_range(0..50));
                    array.add(seq, deadline);
                    tree.add(seq, deadline);
                }
            }
            assert_eq!(array.len(), tree.len());
            assert_eq!(array.next_deadline(), tree.next_deadline());
        }

        for millis in 0..50 {
            assert_eq!(drain(&mut array, at(base, millis)), drain(&mut tree, at(base, millis)));
        }
        assert!(array.is_empty());
        assert!(tree.is_empty());
    }

    #[rstest]
    #[case::short(10, 64)]
    #[case::at_threshold(64, 64)]
    #[case::long(1024, 64)]
    fn test_new_waitlist(#[case] expected_len: usize, #[case] tree_len: usize) {
        let base = Instant::now();
        let mut waitlist = new_waitlist(expected_len, tree_len);
        waitlist.add(2, at(base, 5));
        waitlist.add(1, base);
        assert_eq!(waitlist.pop_due(at(base, 5)), Some(1));
        assert_eq!(waitlist.pop_due(at(base, 5)), Some(2));
    }
}

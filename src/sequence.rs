use rand::Rng;

/// Sequence numbers live in the 31-bit non-negative range of an i32 and wrap from `i32::MAX` to 0
pub fn next_seq(seq: i32) -> i32 {
    if seq == i32::MAX {
        0
    }
    else {
        seq + 1
    }
}

const SEQ_SPACE: i64 = i32::MAX as i64 + 1;

/// Distance from `from` forward to `to`, wrapping through the sequence space
pub fn seq_distance(from: i32, to: i32) -> i64 {
    (to as i64 - from as i64).rem_euclid(SEQ_SPACE)
}

/// `true` if `seq` comes after `accepted`, i.e. it was not delivered yet. Sequence numbers within
///  half the sequence space ahead of `accepted` are considered new, everything else is a
///  duplicate. In particular, 0 is the successor of `i32::MAX`.
pub fn is_ahead(seq: i32, accepted: i32) -> bool {
    let distance = seq_distance(accepted, seq);
    distance > 0 && distance < SEQ_SPACE / 2
}

/// Source of sequence numbers for outgoing sequenced messages
#[derive(Debug, Clone)]
pub struct Sequence {
    next: i32,
}

impl Sequence {
    pub fn new(randomize: bool) -> Sequence {
        if randomize {
            Sequence::starting_at(rand::thread_rng().gen_range(0..i32::MAX))
        }
        else {
            Sequence::starting_at(0)
        }
    }

    pub fn starting_at(seq: i32) -> Sequence {
        Sequence { next: seq.max(0) }
    }

    pub fn next(&mut self) -> i32 {
        let result = self.next;
        self.next = next_seq(result);
        result
    }

    pub fn peek(&self) -> i32 {
        self.next
    }
}

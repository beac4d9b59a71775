//! Result key generation.

use crate::segment::ResultKey;

/// Sequential result keys that wrap to zero at `bound`.
#[derive(Debug)]
pub(crate) struct KeyGenerator {
    next: u32,
    bound: u32,
}

impl KeyGenerator {
    pub fn new(bound: u32) -> Self {
        Self {
            next: 0,
            bound: bound.max(1),
        }
    }

    pub fn next_key(&mut self) -> ResultKey {
        let key = ResultKey::new(self.next);
        self.next = if self.next + 1 >= self.bound {
            0
        } else {
            self.next + 1
        };
        key
    }
}

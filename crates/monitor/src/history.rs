use std::collections::VecDeque;

use crate::reading::Reading;

/// Number of readings retained per session.
pub const DEFAULT_CAPACITY: usize = 30;

/// Fixed-capacity rolling window of readings, oldest first.
#[derive(Debug, Clone)]
pub struct History {
    readings: VecDeque<Reading>,
    capacity: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl History {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            readings: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `reading`, evicting the oldest entry once capacity is exceeded.
    /// Returns the evicted reading, if any.
    pub fn append(&mut self, reading: Reading) -> Option<Reading> {
        self.readings.push_back(reading);
        if self.readings.len() > self.capacity {
            self.readings.pop_front()
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        self.readings.clear();
    }

    pub fn latest(&self) -> Option<&Reading> {
        self.readings.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reading> {
        self.readings.iter()
    }

    pub fn to_vec(&self) -> Vec<Reading> {
        self.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

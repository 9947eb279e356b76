//! Fixed-capacity history of guided predictions.

use candle_core::Tensor;

/// Number of past predictions the multistep update reads.
pub const HISTORY_LEN: usize = 3;

/// Ring buffer of the most recent [`HISTORY_LEN`] predictions; pushing into a
/// full buffer evicts the oldest entry.
#[derive(Debug, Clone, Default)]
pub struct PredictionHistory {
    slots: [Option<Tensor>; HISTORY_LEN],
    head: usize,
    len: usize,
}

impl PredictionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == HISTORY_LEN
    }

    pub fn push(&mut self, prediction: Tensor) {
        if self.len < HISTORY_LEN {
            let slot = (self.head + self.len) % HISTORY_LEN;
            self.slots[slot] = Some(prediction);
            self.len += 1;
        } else {
            self.slots[self.head] = Some(prediction);
            self.head = (self.head + 1) % HISTORY_LEN;
        }
    }

    /// `age` 0 is the most recent prediction.
    pub fn recent(&self, age: usize) -> Option<&Tensor> {
        if age >= self.len {
            return None;
        }
        let oldest_first = self.len - 1 - age;
        self.slots[(self.head + oldest_first) % HISTORY_LEN].as_ref()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

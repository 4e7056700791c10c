//! Interleaved acknowledgement policy for chunk writes.
//!
//! The peripheral has a small receive buffer. Confirming every chunk is
//! slow, confirming none overruns the buffer. The [`InterleavePolicy`]
//! allows `budget` unconfirmed writes, then forces one confirmed write, so
//! at most `budget` unacknowledged chunks are ever in flight.
//!
//! ```text
//! budget = 3:  U U U C U U U C U U ...
//! budget = 0:  C C C C ...
//! ```

/// Delivery guarantee requested for one write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteMode {
    /// Write-with-response: completes after the peripheral acknowledged.
    Confirmed,
    /// Write-without-response: completes once queued.
    Unconfirmed,
}

/// Countdown deciding the mode of each successive chunk write.
#[derive(Debug, Clone)]
pub struct InterleavePolicy {
    /// Unconfirmed writes allowed between confirmed ones.
    budget: usize,
    /// Unconfirmed writes left before the next confirmed one.
    remaining: usize,
}

impl InterleavePolicy {
    /// Create a policy with the given budget. The countdown starts full.
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            remaining: budget,
        }
    }

    /// Mode for the next write; advances the countdown.
    #[inline]
    pub fn next_mode(&mut self) -> WriteMode {
        if self.remaining > 0 {
            self.remaining -= 1;
            WriteMode::Unconfirmed
        } else {
            self.remaining = self.budget;
            WriteMode::Confirmed
        }
    }

    /// Confirmed writes a transfer of `chunks` chunks will issue.
    pub fn confirmed_count(chunks: usize, budget: usize) -> usize {
        chunks / (budget + 1)
    }
}

impl Iterator for InterleavePolicy {
    type Item = WriteMode;

    fn next(&mut self) -> Option<WriteMode> {
        Some(self.next_mode())
    }
}

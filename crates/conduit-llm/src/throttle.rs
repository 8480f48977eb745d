//! Client-side request pacing over a sliding one-minute window

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

const SPAN: Duration = Duration::from_secs(60);

/// Start times of recent attempts
#[derive(Debug)]
pub struct RequestWindow {
    limit: usize,
    stamps: VecDeque<Instant>,
}

impl RequestWindow {
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            limit: usize::try_from(requests_per_minute.max(1)).unwrap_or(usize::MAX),
            stamps: VecDeque::new(),
        }
    }

    /// Claim a slot at `now`, or report how long until the oldest entry ages out
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        while self.stamps.front().is_some_and(|&at| now.duration_since(at) >= SPAN) {
            self.stamps.pop_front();
        }

        if self.stamps.len() >= self.limit {
            let oldest = self.stamps.front().copied().unwrap_or(now);
            return Err(SPAN.saturating_sub(now.duration_since(oldest)));
        }

        self.stamps.push_back(now);
        Ok(())
    }

    pub fn in_flight(&self) -> usize {
        self.stamps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_limit_then_reports_wait() {
        let start = Instant::now();
        let mut window = RequestWindow::new(2);

        assert!(window.try_acquire(start).is_ok());
        assert!(window.try_acquire(start + Duration::from_secs(10)).is_ok());

        let wait = window.try_acquire(start + Duration::from_secs(15)).unwrap_err();
        assert_eq!(wait, Duration::from_secs(45));
        assert_eq!(window.in_flight(), 2);
    }

    #[test]
    fn old_entries_age_out() {
        let start = Instant::now();
        let mut window = RequestWindow::new(1);

        window.try_acquire(start).unwrap();
        assert!(window.try_acquire(start + Duration::from_secs(59)).is_err());
        assert!(window.try_acquire(start + Duration::from_secs(60)).is_ok());
        assert_eq!(window.in_flight(), 1);
    }
}

use std::time::Duration;

/// Hands out the same delay forever. Bound it with [`Iterator::take`].
#[derive(Debug, Clone, Copy)]
pub struct Interval {
    delay: Duration,
}

impl Interval {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }
}

impl Iterator for Interval {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeats_the_same_delay() {
        let mut interval = Interval::from_millis(5);
        assert_eq!(interval.next(), Some(Duration::from_millis(5)));
        assert_eq!(interval.next(), Some(Duration::from_millis(5)));
    }

    #[test]
    fn take_bounds_the_attempts() {
        let delays: Vec<_> = Interval::new(Duration::from_secs(1)).take(2).collect();
        assert_eq!(delays, vec![Duration::from_secs(1); 2]);
    }
}

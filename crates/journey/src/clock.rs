use chrono::{DateTime, Duration, TimeZone, Utc};

/// Timestamp source for a [`crate::Driver`].
#[derive(Debug, Clone, PartialEq)]
pub enum Clock {
    /// Wall time.
    Local,
    /// A pinned instant, for tests and one-off replays.
    Fixed(DateTime<Utc>),
    Hourly(HourlyClock),
}

impl Clock {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Clock::Local => Utc::now(),
            Clock::Fixed(ts) => *ts,
            Clock::Hourly(clock) => clock.timestamp(),
        }
    }

    /// Only the hourly clock moves; the others ignore this.
    pub fn advance(&mut self) {
        if let Clock::Hourly(clock) = self {
            clock.advance();
        }
    }

    pub fn has_ended(&self) -> bool {
        match self {
            Clock::Hourly(clock) => clock.has_ended(),
            Clock::Local | Clock::Fixed(_) => false,
        }
    }
}

/// Steps one hour at a time from the hour before `start` to the hour after
/// `end`, so the first tick precedes and the last tick follows the window.
#[derive(Debug, Clone, PartialEq)]
pub struct HourlyClock {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    current: DateTime<Utc>,
}

impl HourlyClock {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        let start = floor_hour(start) - Duration::hours(1);
        let end = floor_hour(end) + Duration::hours(1);
        Self {
            start,
            end,
            current: start,
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.current
    }

    pub fn advance(&mut self) {
        self.current += Duration::hours(1);
    }

    pub fn has_ended(&self) -> bool {
        self.current > self.end
    }
}

fn floor_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp().div_euclid(3600) * 3600;
    Utc.timestamp_opt(secs, 0).single().unwrap_or(ts)
}

//! Simulation periods.
//!
//! A period is a discrete simulation step. Entity state is versioned by
//! period, and every storage tier (live array, lag cache, on-disk history)
//! is addressed by one.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A discrete simulation time step.
///
/// # Examples
///
/// ```
/// use microsim::Period;
///
/// let p = Period::new(2001);
/// assert_eq!(p.prev(), Period::new(2000));
/// assert_eq!(p.next().get(), 2002);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Period(i64);

impl Period {
    /// Creates a period from its raw value.
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw period value.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// The period immediately before this one.
    #[must_use]
    pub const fn prev(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// The period immediately after this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// `count` consecutive periods starting at `start`.
    pub fn range(start: Self, count: u32) -> impl Iterator<Item = Self> {
        (0..i64::from(count)).map(move |offset| Self(start.0 + offset))
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Period {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Period> for i64 {
    fn from(period: Period) -> Self {
        period.0
    }
}

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::aggregated::AggregatedLimit;
use crate::base::Core;
use crate::error::Error;
use crate::parallel::ParallelLimit;
use crate::timespan::TimespanLimit;

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);

/// A count limit over an explicit window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timespan {
    /// Length of the window.
    pub delay: Duration,
    /// Weight which may be committed within the window.
    pub count: usize,
}

/// The constraints of an [`AggregatedLimit`].
///
/// Every constraint which is set has to be satisfied for a token to be
/// accrued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimitOpts {
    /// Hits per second.
    pub per_second: Option<usize>,
    /// Hits per minute.
    pub per_minute: Option<usize>,
    /// Hits per hour.
    pub per_hour: Option<usize>,
    /// Hits per custom window.
    pub per_timespan: Option<Timespan>,
    /// Concurrently held weight.
    pub parallel: Option<usize>,
}

impl LimitOpts {
    /// Build the primitive limits, ordered from the widest window to the
    /// concurrency limit.
    pub(crate) fn build_limits(&self) -> Result<Vec<Constraint>, Error> {
        let mut limits = Vec::new();

        let windows = [
            (self.per_hour, HOUR, "perHour"),
            (self.per_minute, MINUTE, "perMinute"),
            (self.per_second, SECOND, "perSecond"),
        ];

        for (count, delay, field) in windows {
            if let Some(count) = count {
                check_count(count, field)?;
                limits.push(Constraint::Timespan(TimespanLimit::new(delay, count)?));
            }
        }

        if let Some(Timespan { delay, count }) = self.per_timespan {
            check_count(count, "perTimespan")?;

            if delay.is_zero() {
                return Err(Error::Configuration {
                    field: "perTimespan",
                    message: "delay value should be above zero integer",
                });
            }

            limits.push(Constraint::Timespan(TimespanLimit::new(delay, count)?));
        }

        if let Some(count) = self.parallel {
            check_count(count, "parallel")?;
            limits.push(Constraint::Parallel(ParallelLimit::new(count)?));
        }

        Ok(limits)
    }
}

fn check_count(count: usize, field: &'static str) -> Result<(), Error> {
    if count == 0 {
        return Err(Error::Configuration {
            field,
            message: "count value should be above zero integer",
        });
    }

    Ok(())
}

/// One of the primitive limits making up an [`AggregatedLimit`].
#[derive(Clone)]
pub(crate) enum Constraint {
    Timespan(TimespanLimit),
    Parallel(ParallelLimit),
}

impl Constraint {
    pub(crate) fn core(&self) -> &Arc<Core> {
        match self {
            Constraint::Timespan(limit) => limit.core(),
            Constraint::Parallel(limit) => limit.core(),
        }
    }
}

impl fmt::Debug for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::Timespan(limit) => limit.fmt(f),
            Constraint::Parallel(limit) => limit.fmt(f),
        }
    }
}

/// Builder for an [`AggregatedLimit`].
#[derive(Debug, Default, Clone)]
pub struct Builder {
    opts: LimitOpts,
}

impl Builder {
    /// Allow `count` hits per second.
    #[inline(always)]
    pub fn per_second(mut self, count: usize) -> Self {
        self.opts.per_second = Some(count);
        self
    }

    /// Allow `count` hits per minute.
    #[inline(always)]
    pub fn per_minute(mut self, count: usize) -> Self {
        self.opts.per_minute = Some(count);
        self
    }

    /// Allow `count` hits per hour.
    #[inline(always)]
    pub fn per_hour(mut self, count: usize) -> Self {
        self.opts.per_hour = Some(count);
        self
    }

    /// Allow `count` hits per `delay`.
    #[inline(always)]
    pub fn per_timespan(mut self, delay: Duration, count: usize) -> Self {
        self.opts.per_timespan = Some(Timespan { delay, count });
        self
    }

    /// Allow `count` weight to be held at the same time.
    #[inline(always)]
    pub fn parallel(mut self, count: usize) -> Self {
        self.opts.parallel = Some(count);
        self
    }

    /// Construct the limit.
    pub fn build(self) -> Result<AggregatedLimit, Error> {
        AggregatedLimit::new(self.opts)
    }
}

#[cfg(test)]
mod tests {
    use super::{Constraint, LimitOpts, Timespan};
    use crate::error::Error;
    use std::time::Duration;

    #[test]
    fn test_order() -> Result<(), Error> {
        let opts = LimitOpts {
            per_second: Some(1),
            per_minute: Some(2),
            per_hour: Some(3),
            per_timespan: Some(Timespan {
                delay: Duration::from_millis(10),
                count: 4,
            }),
            parallel: Some(5),
        };

        let limits = opts.build_limits()?;

        let shape = limits
            .iter()
            .map(|limit| match limit {
                Constraint::Timespan(limit) => (Some(limit.delay()), limit.max_weight()),
                Constraint::Parallel(limit) => (None, limit.max_weight()),
            })
            .map(|(delay, max)| Ok::<_, Error>((delay, max?)))
            .collect::<Result<Vec<_>, Error>>()?;

        assert_eq!(
            shape,
            [
                (Some(Duration::from_secs(3600)), 3),
                (Some(Duration::from_secs(60)), 2),
                (Some(Duration::from_secs(1)), 1),
                (Some(Duration::from_millis(10)), 4),
                (None, 5),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_empty() -> Result<(), Error> {
        assert!(LimitOpts::default().build_limits()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_non_positive() {
        let opts = LimitOpts {
            per_minute: Some(0),
            ..LimitOpts::default()
        };

        assert!(matches!(
            opts.build_limits(),
            Err(Error::Configuration {
                field: "perMinute",
                ..
            })
        ));

        let opts = LimitOpts {
            per_timespan: Some(Timespan {
                delay: Duration::ZERO,
                count: 1,
            }),
            ..LimitOpts::default()
        };

        assert!(matches!(
            opts.build_limits(),
            Err(Error::Configuration {
                field: "perTimespan",
                ..
            })
        ));
    }
}

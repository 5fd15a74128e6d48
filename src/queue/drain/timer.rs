use std::fmt::Display;

use std::time::Duration;

/// Where a submission pass spent its time
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Timer {
    pub(crate) planning: Duration,
    pub(crate) submitting: Duration,
    pub(crate) throttling: Duration,
    pub(crate) sleeping: Duration,
}

impl Display for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.1} s planning, {:.1} s submitting, {:.1} s throttled, \
	     {:.1} s sleeping",
            self.planning.as_millis() as f64 / 1000.0,
            self.submitting.as_millis() as f64 / 1000.0,
            self.throttling.as_millis() as f64 / 1000.0,
            self.sleeping.as_millis() as f64 / 1000.0,
        )
    }
}

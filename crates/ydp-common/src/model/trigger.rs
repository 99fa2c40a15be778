//! Cron triggers
//!
//! Triggers are declared with standard 5-field cron syntax plus a label.
//! The `cron` crate expects a leading seconds field, so evaluation prefixes
//! `0`.

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Result, YdpError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronTrigger {
    /// Human label, e.g. "Every 5 minute"
    pub label: String,
    /// 5-field expression, e.g. "*/5 * * * *"
    pub expression: String,
}

impl CronTrigger {
    pub fn new(label: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            expression: expression.into(),
        }
    }

    pub fn schedule(&self) -> Result<Schedule> {
        let fields = self.expression.split_whitespace().count();
        if fields != 5 {
            return Err(YdpError::InvalidCron {
                expression: self.expression.clone(),
                reason: format!("expected 5 fields, found {}", fields),
            });
        }

        Schedule::from_str(&format!("0 {}", self.expression.trim())).map_err(|e| {
            YdpError::InvalidCron {
                expression: self.expression.clone(),
                reason: e.to_string(),
            }
        })
    }

    /// First firing strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        Ok(self.schedule()?.after(&after).next())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_every_five_minutes() {
        let trigger = CronTrigger::new("Every 5 minute", "*/5 * * * *");
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 9, 2, 30).unwrap();
        let next = trigger.next_after(now).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 10, 16, 9, 5, 0).unwrap());
    }

    #[test]
    fn test_rejects_six_fields() {
        let trigger = CronTrigger::new("bad", "0 */5 * * * *");
        assert!(matches!(trigger.schedule(), Err(YdpError::InvalidCron { .. })));
    }

    #[test]
    fn test_rejects_garbage() {
        let trigger = CronTrigger::new("bad", "every now and then");
        assert!(trigger.schedule().is_err());
    }
}

//! Cron-driven firing loop
//!
//! One loop per scheduled unit. Each firing is spawned as its own task so a
//! slow run never delays the clock; overlapping firings are resolved by the
//! unit's single-flight lock, not here.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

use ydp_common::model::CronTrigger;

/// Wait for `trigger`'s firings until `shutdown` flips, spawning `fire` at
/// each one.
pub async fn run_cron<F, Fut>(
    unit: String,
    trigger: CronTrigger,
    mut shutdown: watch::Receiver<bool>,
    mut fire: F,
) where
    F: FnMut(DateTime<Utc>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    info!(unit = %unit, trigger = %trigger.label, cron = %trigger.expression, "Cron loop started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let now = Utc::now();
        let next = match trigger.next_after(now) {
            Ok(Some(next)) => next,
            Ok(None) => {
                info!(unit = %unit, "Trigger has no further firings");
                break;
            },
            Err(e) => {
                error!(unit = %unit, error = %e, "Invalid trigger, loop stopped");
                break;
            },
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        debug!(unit = %unit, next = %next, "Next firing scheduled");

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                tokio::spawn(fire(next));
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!(unit = %unit, "Cron loop stopped");
}

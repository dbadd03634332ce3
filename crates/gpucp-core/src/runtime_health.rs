//! Runtime starvation watchdog.
//!
//! A timed sleep on a healthy runtime wakes up close to on schedule;
//! when the worker pool or a scheduler wedges the executor, the wakeup
//! drifts. Measuring that drift is a cheap whole-process liveness
//! signal that needs no instrumentation in the loops themselves.

use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{error, info, warn};

const CHECK_INTERVAL: Duration = Duration::from_secs(10);
const DRIFT_TOLERANCE: Duration = Duration::from_secs(5);
const CRITICAL_CONSECUTIVE_DELAYS: u32 = 3;

pub async fn watch(mut shutdown: broadcast::Receiver<()>) {
    let mut last_wakeup = Instant::now();
    let mut consecutive_delays = 0u32;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("runtime watchdog stopping");
                break;
            }
            _ = tokio::time::sleep(CHECK_INTERVAL) => {
                let elapsed = last_wakeup.elapsed();

                if elapsed > CHECK_INTERVAL + DRIFT_TOLERANCE {
                    consecutive_delays += 1;
                    warn!(
                        expected_secs = CHECK_INTERVAL.as_secs(),
                        actual_secs = elapsed.as_secs(),
                        consecutive_delays,
                        "watchdog wakeup drifted, runtime may be starved"
                    );

                    if consecutive_delays >= CRITICAL_CONSECUTIVE_DELAYS {
                        error!(
                            consecutive_delays,
                            "runtime starvation persists across checks"
                        );
                    }
                } else if consecutive_delays > 0 {
                    info!("watchdog wakeups back on schedule");
                    consecutive_delays = 0;
                }

                last_wakeup = Instant::now();
            }
        }
    }
}

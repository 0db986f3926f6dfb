// SPDX-License-Identifier: GPL-3.0-only

//! Service-wide timing and threshold constants

use std::time::Duration;

/// Capture loop timing
pub mod capture {
    use super::Duration;

    /// Target interval between published frames (~30 fps)
    pub const FRAME_INTERVAL: Duration = Duration::from_millis(33);

    /// Pause after a failed read before trying again
    pub const READ_RETRY_PAUSE: Duration = Duration::from_millis(300);

    /// Consecutive read failures that trigger a full handle restart
    pub const READ_FAILURE_THRESHOLD: u32 = 5;

    /// Delay after releasing a handle before reopening, giving the driver
    /// time to free the device node (release is asynchronous in the kernel)
    pub const RELEASE_SETTLE: Duration = Duration::from_millis(500);
}

/// Retry/backoff defaults shared by manager, stream and watchdog
pub mod retry {
    use super::Duration;

    /// Total open attempts before giving up
    pub const OPEN_MAX_ATTEMPTS: u32 = 5;

    /// Delay after the first failed attempt
    pub const OPEN_BASE_DELAY: Duration = Duration::from_secs(2);

    /// Exponential growth factor between attempts
    pub const BACKOFF_MULTIPLIER: f64 = 2.0;

    /// Backoff ceiling
    pub const BACKOFF_CEILING: Duration = Duration::from_secs(30);
}

/// Thread shutdown budgets
pub mod shutdown {
    use super::Duration;

    /// How long `stop()` waits for a loop thread before detaching it
    pub const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

    /// Delay between stop and start in a restart
    pub const RESTART_DELAY: Duration = Duration::from_millis(500);
}

/// Photo capture behaviour
pub mod photo {
    use super::Duration;

    /// A buffered frame older than this is not used for a still
    pub const FRESH_WINDOW: Duration = Duration::from_secs(2);

    /// Frames discarded after a settings change so the sensor settles
    pub const WARMUP_FRAMES: u32 = 2;

    /// Direct-read attempts before the capture is declared failed
    pub const READ_ATTEMPTS: u32 = 5;

    /// Pause between direct-read attempts
    pub const READ_RETRY_PAUSE: Duration = Duration::from_millis(500);
}

/// Recording behaviour
pub mod recording {
    use super::Duration;

    /// Abort a recording when no frame has arrived for this long
    pub const FRAME_GAP_GRACE: Duration = Duration::from_secs(5);

    /// Pause while waiting for the first frame
    pub const EMPTY_POLL_PAUSE: Duration = Duration::from_millis(50);

    /// Log progress every N written frames
    pub const PROGRESS_LOG_INTERVAL: u64 = 30;
}

/// Watchdog behaviour
pub mod watchdog {
    use super::Duration;

    /// Interval between health checks
    pub const CHECK_INTERVAL: Duration = Duration::from_secs(10);

    /// Consecutive failed repairs before escalating to a device reset
    pub const ESCALATION_THRESHOLD: u32 = 3;

    /// Minimum spacing between forced device resets
    pub const RESET_COOLDOWN: Duration = Duration::from_secs(300);
}

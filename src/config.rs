// Compile-time configuration for the keyboard daemon

use std::time::Duration;

/// Directory scanned for passthrough key CSVs at startup and watched for
/// changes afterwards.
pub const KEYS_DIR: &str = "/var/lib/kbdd/keys";

/// Unix socket the macro daemon connects to. The parent directory is
/// root-owned, which is the only authentication the peer gets.
pub const SOCKET_PATH: &str = "/var/lib/kbdd/kbd.sock";

/// Directory watched for hot-plugged input devices.
pub const INPUT_DIR: &str = "/dev/input";

/// Consecutive macro-daemon socket failures tolerated before the daemon
/// gives up and exits.
pub const MAX_SOCKET_ERRORS: u32 = 30;

/// Poll tick for the device multiplexer. Short enough that shutdown and
/// hot-plug changes are observed promptly.
pub const POLL_TIMEOUT_MS: i32 = 64;

/// Poll tick for the inotify reactors.
pub const WATCH_TIMEOUT_MS: i32 = 500;

/// Deadline on each framed read from the macro daemon. A wedged peer must
/// not stall keystroke delivery indefinitely.
pub const RECV_DEADLINE: Duration = Duration::from_secs(1);

/// Step and cap for the hot-plug permission settle loop. Fresh
/// /dev/input/eventN nodes appear as root:root 0600 before udev fixes them up.
pub const SETTLE_STEP: Duration = Duration::from_micros(100);
pub const SETTLE_CAP: Duration = Duration::from_secs(5);

/// Exclusive-grab retries at startup, with linear backoff between attempts.
pub const GRAB_RETRIES: u32 = 5;
pub const GRAB_BACKOFF: Duration = Duration::from_millis(50);

/// Group that owns settled input device nodes.
pub const INPUT_GROUP: &str = "input";

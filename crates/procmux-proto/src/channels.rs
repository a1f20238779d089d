//! Named channel helpers shared by publishers and subscribers.
//!
//! Channels are plain strings and need no declaration; these helpers keep the
//! naming scheme in one place.

/// Prefix of every per-process channel.
pub const PROCESS_CHANNEL_PREFIX: &str = "process:";

/// Channel carrying output and status frames for one process (`process:<id>`).
pub fn process(process_id: &str) -> String {
    format!("{PROCESS_CHANNEL_PREFIX}{process_id}")
}

/// Extract the process ID from a `process:<id>` channel name.
pub fn process_id(channel: &str) -> Option<&str> {
    channel
        .strip_prefix(PROCESS_CHANNEL_PREFIX)
        .filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_channel_name() {
        assert_eq!(process("proc-7"), "process:proc-7");
    }

    #[test]
    fn parse_process_channel() {
        assert_eq!(process_id("process:proc-1"), Some("proc-1"));
        assert_eq!(process_id("process:"), None);
        assert_eq!(process_id("events"), None);
    }
}

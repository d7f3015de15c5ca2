//! Process memory measurements for the experiment runners.
//!
//! The scalability runner spawns one worker process per measurement and reads its peak
//! resident set size before the worker exits. On Linux the value comes from the
//! `VmHWM` ("high water mark") line of `/proc/self/status`; elsewhere it is reported as
//! `0`.

/// Extracts the value of a `Key:   value kB` line from a `/proc/<pid>/status` dump.
///
/// # Returns
/// The value in kilobytes, or `None` if the key is missing or not a number.
pub fn parse_status_kb(status: &str, key: &str) -> Option<u64> {
    status.lines().find_map(|line| {
        let rest = line.strip_prefix(key)?.strip_prefix(':')?;
        rest.split_whitespace().next()?.parse().ok()
    })
}

/// Peak resident set size of the current process in kilobytes.
///
/// Returns `0` if the value cannot be read.
#[cfg(target_os = "linux")]
pub fn peak_rss_kb() -> u64 {
    match std::fs::read_to_string("/proc/self/status") {
        Ok(status) => parse_status_kb(&status, "VmHWM").unwrap_or_else(|| {
            log::warn!("No VmHWM line in /proc/self/status; reporting 0.");
            0
        }),
        Err(e) => {
            log::warn!("Failed to read /proc/self/status: {e}");
            0
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn peak_rss_kb() -> u64 {
    use std::sync::Once;
    static WARN_ONCE: Once = Once::new();
    WARN_ONCE.call_once(|| {
        log::warn!("Peak RSS measurement is only supported on Linux; reporting 0.");
    });
    0
}

//! Memory sampling through `/proc`.

use std::path::PathBuf;

/// Resident set size of `pid` in bytes, or `None` once the process is gone.
pub async fn rss_bytes(pid: u32) -> Option<u64> {
    let path = PathBuf::from(format!("/proc/{}/status", pid));
    let status = tokio::fs::read_to_string(path).await.ok()?;
    parse_vm_rss(&status)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

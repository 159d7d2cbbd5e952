//! Lease reaper: find and terminate stray processes carrying a lease
//! environment marker. Spawned tunnel sessions get tagged so an unclean exit
//! can be mopped up on the next run. Linux only; other platforms report
//! nothing to reap.

use std::time::Duration;

use tracing::info;

use super::terminate;

/// PIDs whose environment contains `key=value`, excluding `exclude` and the
/// calling process itself.
#[cfg(target_os = "linux")]
pub fn find_leased(key: &str, value: &str, exclude: &[i32]) -> Vec<i32> {
    let needle = format!("{key}={value}");
    let own_pid = std::process::id() as i32;
    let mut found = Vec::new();

    let Ok(entries) = std::fs::read_dir("/proc") else {
        return found;
    };
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        else {
            continue;
        };
        if pid == own_pid || exclude.contains(&pid) {
            continue;
        }
        // environ is NUL-separated; unreadable entries (permissions, races
        // with exit) are skipped silently.
        let Ok(raw) = std::fs::read(entry.path().join("environ")) else {
            continue;
        };
        let has_lease = raw
            .split(|b| *b == 0)
            .any(|pair| pair == needle.as_bytes());
        if has_lease {
            found.push(pid);
        }
    }
    found
}

#[cfg(not(target_os = "linux"))]
pub fn find_leased(_key: &str, _value: &str, _exclude: &[i32]) -> Vec<i32> {
    Vec::new()
}

/// Terminate every process carrying the lease. Returns the count signalled.
pub async fn reap_leased(key: &str, value: &str, exclude: &[i32], gentle: Duration) -> usize {
    let pids = find_leased(key, value, exclude);
    for pid in &pids {
        info!(pid, lease = %key, "reaping leased process");
        terminate(*pid, true, gentle).await;
    }
    pids.len()
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::supervisor::pid_alive;

    const LEASE_KEY: &str = "ASD_TEST_LEASE";

    #[test]
    fn finds_child_with_lease() {
        let lease_value = format!("find-{}", std::process::id());
        let mut child = std::process::Command::new("/bin/sleep")
            .arg("30")
            .env(LEASE_KEY, &lease_value)
            .spawn()
            .unwrap();
        let pid = child.id() as i32;

        let found = find_leased(LEASE_KEY, &lease_value, &[]);
        assert!(found.contains(&pid), "expected {pid} in {found:?}");

        // An exclusion list hides the PID.
        let excluded = find_leased(LEASE_KEY, &lease_value, &[pid]);
        assert!(!excluded.contains(&pid));

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[tokio::test]
    async fn reap_terminates_leased_process() {
        let lease_value = format!("reap-{}", std::process::id());
        let mut child = std::process::Command::new("/bin/sleep")
            .arg("30")
            .env(LEASE_KEY, &lease_value)
            .spawn()
            .unwrap();
        let pid = child.id() as i32;

        let count = reap_leased(LEASE_KEY, &lease_value, &[], Duration::from_millis(300)).await;
        assert_eq!(count, 1);
        child.wait().unwrap();
        assert!(!pid_alive(pid));
    }
}

//! Whole-tree termination for spawned children.
//!
//! On Unix the child calls `setsid()` before exec, so its pid doubles as the
//! process group id and a negative-pid `kill` reaches every descendant that
//! has not moved itself into another session. On Linux those that have are
//! tracked separately as strays through `/proc`.

use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TreeSignal {
    Graceful,
    Force,
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the agent dies, the kernel terminates the child for us.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

/// Puts the child in its own session so the whole tree can be signalled.
pub(crate) fn isolate(cmd: &mut Command) {
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            set_parent_death_signal()?;
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }
}

/// Signals every process in the tree rooted at `pid`.
///
/// A tree that is already gone is not an error.
#[cfg(unix)]
pub(crate) async fn signal_tree(pid: u32, signal: TreeSignal) -> std::io::Result<()> {
    let sig = match signal {
        TreeSignal::Graceful => libc::SIGTERM,
        TreeSignal::Force => libc::SIGKILL,
    };
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), sig) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

#[cfg(windows)]
pub(crate) async fn signal_tree(pid: u32, signal: TreeSignal) -> std::io::Result<()> {
    let mut cmd = Command::new("taskkill");
    cmd.arg("/PID").arg(pid.to_string()).arg("/T");
    if signal == TreeSignal::Force {
        cmd.arg("/F");
    }
    cmd.stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    let status = cmd.status().await?;
    // 128: no such process.
    if status.success() || status.code() == Some(128) {
        Ok(())
    } else {
        Err(std::io::Error::other(format!(
            "taskkill exited with {:?}",
            status.code()
        )))
    }
}

/// True while any member of the group rooted at `pid` still exists.
#[cfg(unix)]
pub(crate) fn tree_alive(pid: u32) -> bool {
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), 0) };
    if rc == 0 {
        return true;
    }
    // EPERM: exists but not ours to signal.
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(windows)]
pub(crate) fn tree_alive(_pid: u32) -> bool {
    false
}

/// A descendant that moved to its own process group or session.
///
/// `start_time` (clock ticks since boot) guards against pid reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(crate) struct Stray {
    pub(crate) pid: u32,
    start_time: u64,
}

#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy)]
struct ProcStat {
    pid: u32,
    state: char,
    ppid: u32,
    pgrp: u32,
    start_time: u64,
}

#[cfg(target_os = "linux")]
fn read_stat(pid: u32) -> Option<ProcStat> {
    let raw = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // comm may contain spaces and parens; fields resume after the last ')'.
    let rest = &raw[raw.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    Some(ProcStat {
        pid,
        state: fields.first()?.chars().next()?,
        ppid: fields.get(1)?.parse().ok()?,
        pgrp: fields.get(2)?.parse().ok()?,
        start_time: fields.get(19)?.parse().ok()?,
    })
}

#[cfg(target_os = "linux")]
fn process_table() -> Vec<ProcStat> {
    let Ok(rd) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    rd.flatten()
        .filter_map(|e| e.file_name().to_str()?.parse::<u32>().ok())
        .filter_map(read_stat)
        .collect()
}

/// Descendants of `root` outside its process group, e.g. after `setsid`.
///
/// Must run while `root` is alive: once it exits they are reparented and
/// no longer traceable.
#[cfg(target_os = "linux")]
pub(crate) fn strays(root: u32) -> Vec<Stray> {
    let table = process_table();
    let mut tree = vec![root];
    let mut out = Vec::new();
    let mut i = 0;
    while i < tree.len() {
        let parent = tree[i];
        for p in table.iter().filter(|p| p.ppid == parent && p.pid != parent) {
            if tree.contains(&p.pid) {
                continue;
            }
            tree.push(p.pid);
            if p.pgrp != root {
                out.push(Stray {
                    pid: p.pid,
                    start_time: p.start_time,
                });
            }
        }
        i += 1;
    }
    out
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn strays(_root: u32) -> Vec<Stray> {
    Vec::new()
}

/// Signals strays that are still the same process; returns how many were hit.
#[cfg(target_os = "linux")]
pub(crate) fn signal_strays(strays: &[Stray], signal: TreeSignal) -> usize {
    let sig = match signal {
        TreeSignal::Graceful => libc::SIGTERM,
        TreeSignal::Force => libc::SIGKILL,
    };
    strays
        .iter()
        .filter(|s| {
            read_stat(s.pid).is_some_and(|p| p.start_time == s.start_time && p.state != 'Z')
        })
        .filter(|s| unsafe { libc::kill(s.pid as libc::pid_t, sig) } == 0)
        .count()
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn signal_strays(_strays: &[Stray], _signal: TreeSignal) -> usize {
    0
}

/// Non-zombie members of process group `pgid`.
///
/// Orphaned zombies linger until init reaps them, so `tree_alive` alone is
/// not a reliable "nothing is running" check in tests.
#[cfg(all(test, target_os = "linux"))]
pub(crate) fn live_members(pgid: u32) -> Vec<u32> {
    process_table()
        .into_iter()
        .filter(|p| p.pgrp == pgid && p.state != 'Z')
        .map(|p| p.pid)
        .collect()
}

#[cfg(all(test, target_os = "linux"))]
pub(crate) fn is_live(pid: u32) -> bool {
    read_stat(pid).is_some_and(|p| p.state != 'Z')
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn force_kills_isolated_group() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 30 & sleep 30; wait");
        isolate(&mut cmd);
        let mut child = cmd.spawn().unwrap();
        let pid = child.id().unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(tree_alive(pid));

        signal_tree(pid, TreeSignal::Force).await.unwrap();
        let status = tokio::time::timeout(Duration::from_secs(2), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());

        // The backgrounded sleep was in the same group.
        #[cfg(target_os = "linux")]
        {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(live_members(pid).is_empty());
        }
    }

    #[tokio::test]
    async fn signalling_a_gone_group_is_ok() {
        let mut cmd = Command::new("true");
        isolate(&mut cmd);
        let mut child = cmd.spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();

        signal_tree(pid, TreeSignal::Graceful).await.unwrap();
        assert!(!tree_alive(pid));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn strays_are_found_and_killed() {
        use tokio::io::AsyncBufReadExt;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("setsid sleep 30 & echo $!; sleep 30")
            .stdout(std::process::Stdio::piped());
        isolate(&mut cmd);
        let mut child = cmd.spawn().unwrap();
        let pid = child.id().unwrap();

        let mut lines = tokio::io::BufReader::new(child.stdout.take().unwrap()).lines();
        let stray_pid: u32 = lines.next_line().await.unwrap().unwrap().trim().parse().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let found = strays(pid);
        assert_eq!(found.iter().map(|s| s.pid).collect::<Vec<_>>(), vec![stray_pid]);

        signal_tree(pid, TreeSignal::Force).await.unwrap();
        child.wait().await.unwrap();
        assert!(is_live(stray_pid), "group kill does not reach a new session");

        assert_eq!(signal_strays(&found, TreeSignal::Force), 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!is_live(stray_pid));
        assert_eq!(signal_strays(&found, TreeSignal::Force), 0);
    }
}

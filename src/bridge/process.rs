//! Toolkit child process: spawn, diagnostics drain, and termination.

use std::collections::BTreeMap;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::ToolkitConfig;
use crate::error::AgentError;
use crate::scopes::ToolkitEnv;

/// Build the complete child environment.
///
/// Nothing is inherited implicitly: only the configured passthrough
/// variables, the configured API keys, and the resolved credentials.
pub fn child_environment<F>(
    config: &ToolkitConfig,
    env: &ToolkitEnv,
    host: F,
) -> BTreeMap<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut vars: BTreeMap<String, String> = config
        .passthrough_env
        .iter()
        .filter_map(|name| host(name).map(|v| (name.clone(), v)))
        .collect();
    vars.extend(config.collect_api_keys(&host));
    // Credentials win over anything a passthrough name could collide with.
    vars.extend(env.to_env_map());
    vars
}

/// Spawn the toolkit with an explicit environment and piped stdio.
pub fn spawn(config: &ToolkitConfig, vars: &BTreeMap<String, String>) -> Result<Child, AgentError> {
    let (program, args) = config
        .command
        .split_first()
        .ok_or_else(|| AgentError::Start("empty toolkit command".to_string()))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .env_clear()
        .envs(vars)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Own process group, so termination reaches anything the toolkit forks.
    #[cfg(unix)]
    cmd.process_group(0);

    // SAFETY: runs in the forked child before exec and only calls prctl.
    // The toolkit gets SIGKILL if the worker dies without cleaning up.
    #[cfg(target_os = "linux")]
    unsafe {
        cmd.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| AgentError::Start(format!("{program}: {e}")))?;

    match child.try_wait() {
        Ok(Some(status)) => Err(AgentError::Start(format!(
            "{program} exited immediately with {status}"
        ))),
        Ok(None) if child.id().is_some() => Ok(child),
        Ok(None) => Err(AgentError::Start(format!("{program}: no process id"))),
        Err(e) => Err(AgentError::Start(format!("{program}: liveness check failed: {e}"))),
    }
}

/// Forward every diagnostic line to the log until the stream closes.
///
/// Bytes that are not UTF-8 are replaced rather than ending the drain; a
/// closed pipe would kill the toolkit on its next write. Returns the number
/// of lines read.
pub async fn drain_diagnostics<R>(stderr: R, pid: u32) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    let mut count = 0;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                count += 1;
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end();
                if line.is_empty() {
                    continue;
                }
                if line.starts_with("Traceback") || line.contains("ERROR") {
                    warn!(pid, "toolkit: {line}");
                } else {
                    info!(pid, "toolkit: {line}");
                }
            }
            Err(e) => {
                warn!(pid, error = %e, "Toolkit diagnostic stream read failed");
                break;
            }
        }
    }
    count
}

/// How the child was brought down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// It had already exited.
    AlreadyExited,
    /// It exited after SIGTERM within the grace period.
    Terminated,
    /// It ignored SIGTERM and was killed.
    Killed,
}

/// Stop the child if it is still running and reap it.
///
/// SIGTERM to the process group, a bounded wait, then SIGKILL. Every group
/// signal goes out before the leader is reaped: an unreaped leader keeps
/// its pid, so the group id cannot have been reused yet.
pub async fn terminate(
    child: &mut Child,
    pid: u32,
    grace: Duration,
) -> (Shutdown, Option<ExitStatus>) {
    // One poll interval lets a child that just closed its pipes finish exiting.
    let shutdown = match wait_for_exit(pid, EXIT_POLL).await {
        ExitPeek::Reaped => return (Shutdown::AlreadyExited, reaped_status(child)),
        ExitPeek::Exited => Shutdown::AlreadyExited,
        ExitPeek::Running => {
            kill_group(pid, Signal::Term);
            match wait_for_exit(pid, grace).await {
                ExitPeek::Reaped => return (Shutdown::Terminated, reaped_status(child)),
                ExitPeek::Exited => Shutdown::Terminated,
                ExitPeek::Running => {
                    warn!(pid, grace_ms = grace.as_millis() as u64, "Toolkit ignored SIGTERM, killing");
                    Shutdown::Killed
                }
            }
        }
    };

    // Strays left in the group after the leader is gone.
    kill_group(pid, Signal::Kill);
    if shutdown == Shutdown::Killed {
        if let Err(e) = child.start_kill() {
            debug!(pid, error = %e, "Toolkit kill returned an error");
        }
    }

    match child.wait().await {
        Ok(status) => (shutdown, Some(status)),
        Err(e) => {
            warn!(pid, error = %e, "Waiting for toolkit exit failed");
            (shutdown, None)
        }
    }
}

const EXIT_POLL: Duration = Duration::from_millis(20);

/// Poll until the child is no longer running, without reaping it.
async fn wait_for_exit(pid: u32, grace: Duration) -> ExitPeek {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        let peek = peek_exit(pid);
        if peek != ExitPeek::Running || tokio::time::Instant::now() >= deadline {
            return peek;
        }
        tokio::time::sleep(EXIT_POLL).await;
    }
}

/// Someone else reaped the child; the pid no longer names our group.
fn reaped_status(child: &mut Child) -> Option<ExitStatus> {
    child.try_wait().ok().flatten()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitPeek {
    Running,
    /// Exited and still waiting to be reaped.
    Exited,
    /// No longer our child.
    Reaped,
}

/// Check the child's state with `WNOWAIT`, leaving a zombie in place.
#[cfg(unix)]
fn peek_exit(pid: u32) -> ExitPeek {
    // SAFETY: siginfo_t is plain data; zeroed is a valid "no child" value.
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    // SAFETY: `info` is a valid, writable siginfo_t for the call.
    let rc = unsafe {
        libc::waitid(
            libc::P_PID,
            pid as libc::id_t,
            &mut info,
            libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
        )
    };
    if rc != 0 {
        return ExitPeek::Reaped;
    }
    if info.si_signo == libc::SIGCHLD {
        ExitPeek::Exited
    } else {
        ExitPeek::Running
    }
}

#[cfg(not(unix))]
fn peek_exit(_pid: u32) -> ExitPeek {
    ExitPeek::Running
}

#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
impl Signal {
    fn raw(self) -> libc::c_int {
        match self {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// Signal the process group led by `pid`. A group that is already gone is
/// not an error.
#[cfg(unix)]
pub fn kill_group(pid: u32, signal: Signal) {
    // SAFETY: killpg has no memory-safety preconditions.
    if unsafe { libc::killpg(pid as libc::pid_t, signal.raw()) } != 0 {
        log_kill_error(pid, "killpg");
    }
}

/// Signal the single process `pid`.
#[cfg(unix)]
pub fn kill_process(pid: u32, signal: Signal) {
    // SAFETY: kill has no memory-safety preconditions.
    if unsafe { libc::kill(pid as libc::pid_t, signal.raw()) } != 0 {
        log_kill_error(pid, "kill");
    }
}

#[cfg(unix)]
fn log_kill_error(pid: u32, call: &str) {
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::ESRCH) {
        debug!(pid, error = %err, "{call} failed");
    }
}

#[cfg(not(unix))]
pub fn kill_group(_pid: u32, _signal: Signal) {}

#[cfg(not(unix))]
pub fn kill_process(_pid: u32, _signal: Signal) {}

/// Whether a process with this id still exists.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs only the existence check.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::scopes::{ClientCredentials, CredentialBundle, ScopeSelection};
    use secrecy::SecretString;

    fn toolkit_env() -> ToolkitEnv {
        let bundle = CredentialBundle {
            access_token: SecretString::from("tok"),
            refresh_token: None,
            expires_at: None,
            granted_scopes: vec!["drive".to_string()],
        };
        let client = ClientCredentials {
            client_id: "cid".to_string(),
            client_secret: SecretString::from("cs"),
        };
        let sel = ScopeSelection::parse(["drive"]).unwrap();
        ToolkitEnv::resolve("u1", &sel, &bundle, &client)
    }

    fn config(command: &[&str]) -> ToolkitConfig {
        ToolkitConfig {
            command: command.iter().map(|s| s.to_string()).collect(),
            passthrough_env: vec!["PATH".to_string()],
            api_key_vars: vec!["OPENAI_API_KEY".to_string()],
            shutdown_grace: Duration::from_millis(500),
        }
    }

    #[test]
    fn environment_is_explicit() {
        let host = |k: &str| match k {
            "PATH" => Some("/usr/bin:/bin".to_string()),
            "OPENAI_API_KEY" => Some("sk-1".to_string()),
            "AWS_SECRET_ACCESS_KEY" => Some("leak".to_string()),
            _ => None,
        };
        let vars = child_environment(&config(&["true"]), &toolkit_env(), host);
        assert_eq!(vars["PATH"], "/usr/bin:/bin");
        assert_eq!(vars["OPENAI_API_KEY"], "sk-1");
        assert_eq!(vars["GOOGLE_ACCESS_TOKEN"], "tok");
        assert!(!vars.contains_key("AWS_SECRET_ACCESS_KEY"));
        assert_eq!(vars.len(), 9);
    }

    #[tokio::test]
    async fn spawn_missing_program_is_start_failure() {
        let err = spawn(&config(&["/nonexistent/toolkit"]), &BTreeMap::new())
            .err()
            .unwrap();
        assert!(matches!(err, AgentError::Start(_)));
    }

    #[tokio::test]
    async fn terminate_stops_running_child() {
        let mut child = spawn(&config(&["/bin/sh", "-c", "sleep 30"]), &BTreeMap::new()).unwrap();
        let pid = child.id().unwrap();
        assert!(is_alive(pid));

        let (shutdown, status) = terminate(&mut child, pid, Duration::from_secs(2)).await;
        assert_eq!(shutdown, Shutdown::Terminated);
        assert!(status.is_some());
        assert!(!is_alive(pid));
    }

    #[tokio::test]
    async fn terminate_kills_child_ignoring_sigterm() {
        let mut child = spawn(
            &config(&["/bin/sh", "-c", "trap '' TERM; while true; do sleep 1; done"]),
            &BTreeMap::new(),
        )
        .unwrap();
        let pid = child.id().unwrap();
        // Let the shell install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let (shutdown, _) = terminate(&mut child, pid, Duration::from_millis(300)).await;
        assert_eq!(shutdown, Shutdown::Killed);
        assert!(!is_alive(pid));
    }

    #[tokio::test]
    async fn drain_keeps_reading_past_invalid_utf8() {
        let input: &[u8] = b"\xff\xfe bad bytes\nsecond\n\nthird";
        assert_eq!(drain_diagnostics(input, 1).await, 4);
    }

    /// Running, as opposed to gone or a zombie waiting for its reaper.
    #[cfg(target_os = "linux")]
    fn is_running(pid: u32) -> bool {
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .map(|stat| !stat.contains(") Z "))
            .unwrap_or(false)
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn terminate_reaches_strays_after_leader_exits() {
        let mut child = spawn(
            &config(&["/bin/sh", "-c", "sleep 30 & echo $!; sleep 0.2"]),
            &BTreeMap::new(),
        )
        .unwrap();
        let pid = child.id().unwrap();
        let mut line = String::new();
        BufReader::new(child.stdout.take().unwrap())
            .read_line(&mut line)
            .await
            .unwrap();
        let stray: u32 = line.trim().parse().unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(is_running(stray));

        let (shutdown, status) = terminate(&mut child, pid, Duration::from_secs(1)).await;
        assert_eq!(shutdown, Shutdown::AlreadyExited);
        assert!(status.unwrap().success());
        for _ in 0..50 {
            if !is_running(stray) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("stray {stray} survived group termination");
    }

    #[tokio::test]
    async fn terminate_reaps_exited_child() {
        let mut child = spawn(&config(&["/bin/sh", "-c", "sleep 0.1"]), &BTreeMap::new()).unwrap();
        let pid = child.id().unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let (shutdown, status) = terminate(&mut child, pid, Duration::from_secs(1)).await;
        assert_eq!(shutdown, Shutdown::AlreadyExited);
        assert!(status.unwrap().success());
        assert!(!is_alive(pid));
    }
}

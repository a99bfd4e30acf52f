use std::io::{BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct CommandRunResult {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandRunResult {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.status.is_some_and(|s| s.success())
    }

    /// Last non-empty stderr line, else stdout's; used in error messages.
    pub fn tail(&self) -> String {
        let pick = |text: &str| {
            text.lines()
                .rev()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .map(str::to_string)
        };
        pick(&self.stderr)
            .or_else(|| pick(&self.stdout))
            .unwrap_or_default()
    }
}

/// How long pipe readers may linger once the child is gone or killed.
const READER_GRACE: Duration = Duration::from_millis(500);

/// Run a child process, killing it once `timeout` elapses. Output is
/// drained on separate threads so a chatty child cannot block on a full
/// pipe. On unix the child leads its own process group and a timeout kills
/// the whole group, so helpers it forked die with it.
pub fn run_command_with_timeout(
    command: &mut Command,
    timeout: Duration,
) -> Result<CommandRunResult, String> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    let mut child = command
        .spawn()
        .map_err(|e| format!("Failed to start command: {}", e))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "Failed to capture stdout".to_string())?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| "Failed to capture stderr".to_string())?;
    let stdout_rx = drain(stdout);
    let stderr_rx = drain(stderr);

    let start = Instant::now();
    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) if start.elapsed() >= timeout => {
                timed_out = true;
                kill_process_tree(&mut child);
                break child.wait().ok();
            }
            Ok(None) => thread::sleep(Duration::from_millis(50)),
            Err(e) => {
                kill_process_tree(&mut child);
                return Err(format!("Failed to wait for command: {}", e));
            }
        }
    };

    // A descendant that escaped the group can still hold the pipes open;
    // never wait on it past the grace period.
    let deadline = Instant::now() + READER_GRACE;
    Ok(CommandRunResult {
        status,
        stdout: collect(&stdout_rx, deadline),
        stderr: collect(&stderr_rx, deadline),
        timed_out,
    })
}

fn drain<R: Read + Send + 'static>(pipe: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = BufReader::new(pipe).read_to_end(&mut buf);
        let _ = tx.send(buf);
    });
    rx
}

fn collect(rx: &Receiver<Vec<u8>>, deadline: Instant) -> String {
    let wait = deadline.saturating_duration_since(Instant::now());
    match rx.recv_timeout(wait) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => {
            tracing::debug!("output pipe still held open by a descendant; dropping its output");
            String::new()
        }
    }
}

fn kill_process_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
            // SAFETY: plain syscall; the group id is the child we spawned
            // as group leader.
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
    }
    let _ = child.kill();
}

/// Whitespace-split argv for env-provided commands. No shell quoting.
pub fn split_command_line(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

pub(crate) fn env_flag_enabled(name: &str) -> bool {
    matches!(
        std::env::var(name)
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "yes"
    )
}

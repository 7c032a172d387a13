//! Engine process launcher.
//!
//! Builds the engine's argument vector, spawns it with all three standard
//! streams piped, and hands back a [`ProcessHandle`] that owns the child for
//! the rest of the invocation.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{HarnessError, Result};

/// File name of the engine executable.
pub const ENGINE_BINARY: &str = if cfg!(windows) {
    "edgelinkd.exe"
} else {
    "edgelinkd"
};

/// Upper bound on how much stderr is kept for diagnostics.
const STDERR_CAP: usize = 64 * 1024;

/// How long to wait for the stderr drain after the child is gone.
const STDERR_DRAIN_WAIT: Duration = Duration::from_secs(1);

/// Upper bound on the blocking reap in `Drop`; SIGKILL lands well within it.
const REAP_ON_DROP_WAIT: Duration = Duration::from_secs(2);
const REAP_POLL: Duration = Duration::from_millis(5);

/// Where the engine gets its flows from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputMode {
    /// Frames are streamed over stdin (`--stdin`).
    Stdin,
    /// The engine loads a flows file itself (`-f <path>`).
    File(PathBuf),
}

/// Locates an engine binary inside a cargo build tree.
///
/// `<build_root>/target/[<target>/]<profile>/edgelinkd`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineLocator {
    pub build_root: PathBuf,
    pub target: Option<String>,
    pub profile: String,
}

impl EngineLocator {
    pub const DEFAULT_PROFILE: &'static str = "release";

    pub fn new(build_root: impl Into<PathBuf>) -> Self {
        Self {
            build_root: build_root.into(),
            target: None,
            profile: Self::DEFAULT_PROFILE.to_string(),
        }
    }

    pub fn binary_path(&self) -> PathBuf {
        let mut path = self.build_root.join("target");
        if let Some(target) = self.target.as_deref().filter(|t| !t.is_empty()) {
            path.push(target);
        }
        path.push(&self.profile);
        path.push(ENGINE_BINARY);
        path
    }
}

/// Everything needed to start the engine, apart from the input mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    pub program: PathBuf,
    /// Passed as `-v <n>`; `0` keeps the engine's own logging quiet.
    pub verbosity: u8,
    /// Passed as `--home <dir>` when set.
    pub home: Option<PathBuf>,
}

impl EngineCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            verbosity: 0,
            home: None,
        }
    }

    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }

    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// The argument vector for the given input mode.
    pub fn args(&self, input: &InputMode) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-v".into(), self.verbosity.to_string().into()];
        match input {
            InputMode::Stdin => args.push("--stdin".into()),
            InputMode::File(path) => {
                args.push("-f".into());
                args.push(path.as_os_str().to_owned());
            }
        }
        if let Some(home) = &self.home {
            args.push("--home".into());
            args.push(home.as_os_str().to_owned());
        }
        args
    }
}

/// A running engine process and its pipes.
///
/// Callers are expected to call [`ProcessHandle::terminate`]. A handle
/// dropped while the child is still running kills and reaps it on the spot.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

/// Spawn the engine.
pub fn launch(command: &EngineCommand, input: &InputMode) -> Result<ProcessHandle> {
    let launch_error = |source: std::io::Error| HarnessError::Launch {
        program: command.program.clone(),
        source,
    };

    let mut cmd = Command::new(&command.program);
    cmd.args(command.args(input))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // CTRL_BREAK only reaches processes in our group if the child has its own.
    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    let mut child = cmd.spawn().map_err(launch_error)?;
    let pid = child
        .id()
        .ok_or_else(|| launch_error(std::io::Error::other("child exited before it got a pid")))?;

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take().map(|mut pipe| {
        tokio::spawn(async move {
            let mut kept = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let room = STDERR_CAP.saturating_sub(kept.len());
                        kept.extend_from_slice(&chunk[..n.min(room)]);
                    }
                }
            }
            kept
        })
    });

    debug!(pid, program = %command.program.display(), "engine launched");

    Ok(ProcessHandle {
        child,
        pid,
        stdin,
        stdout,
        stderr,
    })
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Ask the engine to shut down gracefully.
    ///
    /// SIGINT on unix, CTRL_BREAK to the child's process group on Windows.
    pub fn interrupt(&mut self) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            let pid = libc::pid_t::try_from(self.pid).map_err(std::io::Error::other)?;
            // SAFETY: pid belongs to a child we spawned and have not reaped.
            let ret = unsafe { libc::kill(pid, libc::SIGINT) };
            if ret != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        }
        #[cfg(windows)]
        {
            use windows::Win32::System::Console::{CTRL_BREAK_EVENT, GenerateConsoleCtrlEvent};

            // The child leads its own process group, so its pid is the group id.
            // SAFETY: plain FFI call with no pointers.
            unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, self.pid) }
                .map_err(std::io::Error::other)
        }
        #[cfg(not(any(unix, windows)))]
        {
            self.child.start_kill()
        }
    }

    /// Wait up to `grace` for the child to exit on its own.
    pub async fn wait_for_exit(&mut self, grace: Duration) -> std::io::Result<Option<ExitStatus>> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Kill the child (if still running) and reap it.
    pub async fn terminate(&mut self) -> std::io::Result<ExitStatus> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }
        warn!(pid = self.pid, "force-killing engine");
        self.child.kill().await?;
        self.child.wait().await
    }

    /// Check whether the child is still alive.
    pub fn is_running(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(e) => {
                warn!(pid = self.pid, error = %e, "error checking engine status");
                false
            }
        }
    }

    /// Collect what the child wrote to stderr.
    ///
    /// Meant to be called after the child is gone. A grandchild still
    /// holding the pipe open only delays this by a bounded amount.
    pub async fn stderr_output(&mut self) -> Vec<u8> {
        let Some(mut task) = self.stderr.take() else {
            return Vec::new();
        };
        match tokio::time::timeout(STDERR_DRAIN_WAIT, &mut task).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                debug!(error = %e, "stderr drain task failed");
                Vec::new()
            }
            Err(_) => {
                task.abort();
                Vec::new()
            }
        }
    }
}

impl Drop for ProcessHandle {
    /// Kill and reap a child that is still running.
    ///
    /// Only does anything when the handle is dropped mid-invocation, e.g.
    /// when the future driving a run is dropped by an outer timeout.
    fn drop(&mut self) {
        if !matches!(self.child.try_wait(), Ok(None)) {
            return;
        }
        warn!(pid = self.pid, "engine still running on drop, killing it");
        if let Err(e) = self.child.start_kill() {
            warn!(pid = self.pid, error = %e, "failed to kill engine");
            return;
        }
        let give_up = Instant::now() + REAP_ON_DROP_WAIT;
        while Instant::now() < give_up {
            match self.child.try_wait() {
                Ok(None) => std::thread::sleep(REAP_POLL),
                Ok(Some(_)) => return,
                Err(e) => {
                    warn!(pid = self.pid, error = %e, "failed to reap engine");
                    return;
                }
            }
        }
        warn!(pid = self.pid, "engine not reaped after kill");
    }
}

/// `true` if `path` looks like something we could execute.
pub fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.is_file() && meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        meta.is_file()
    }
}

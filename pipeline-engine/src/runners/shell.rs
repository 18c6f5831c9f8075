// Shell Executor
// Runs `script:` and `bash:` step bodies as child processes

use crate::error::ExecError;
use crate::runners::{CommandExecutor, CommandOutput, CommandRequest};

use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

/// How long output is still collected after the shell exits. Background jobs
/// that inherited the pipes would otherwise hold the step open.
const OUTPUT_GRACE: Duration = Duration::from_millis(200);

/// Shells a step body can run under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Shell {
    /// `script:` steps
    #[default]
    Sh,
    /// `bash:` steps
    Bash,
}

impl Shell {
    /// Executable and the arguments that precede the script
    pub fn command(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            Shell::Sh => ("sh", &["-c"]),
            Shell::Bash => ("bash", &["-c"]),
        }
    }
}

impl fmt::Display for Shell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command().0)
    }
}

/// Production executor backed by `tokio::process`.
///
/// Each step runs in its own process group. Dropping the execute future
/// before the shell exits (for example when a timeout fires) kills the whole
/// group. Background jobs of a shell that exited normally keep running, so a
/// display server started in one step serves the later ones.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellExecutor;

impl ShellExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Owns a running step's process group and output readers
struct StepProcess {
    pgid: Option<u32>,
    readers: Vec<AbortHandle>,
    exited: bool,
}

impl Drop for StepProcess {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
        if !self.exited {
            if let Some(pgid) = self.pgid {
                kill_process_group(pgid);
            }
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Ok(pgid) = i32::try_from(pgid) else {
        return;
    };
    match signal::kill(Pid::from_raw(-pgid), Signal::SIGKILL) {
        Ok(()) => debug!(pgid, "killed step process group"),
        Err(err) => debug!(pgid, %err, "process group already gone"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, request: CommandRequest<'_>) -> Result<CommandOutput, ExecError> {
        let (program, args) = request.shell.command();

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(request.script)
            .current_dir(request.working_dir)
            .envs(request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            shell: program.to_string(),
            source,
        })?;

        debug!(shell = program, pid = child.id(), "spawned step process");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut process = StepProcess {
            pgid: child.id(),
            readers: vec![
                tokio::spawn(read_lines(child.stdout.take(), Stream::Stdout, tx.clone()))
                    .abort_handle(),
                tokio::spawn(read_lines(child.stderr.take(), Stream::Stderr, tx)).abort_handle(),
            ],
            exited: false,
        };

        let status = child.wait().await.map_err(|source| ExecError::Wait {
            shell: program.to_string(),
            source,
        })?;
        process.exited = true;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let grace = tokio::time::Instant::now() + OUTPUT_GRACE;
        loop {
            match tokio::time::timeout_at(grace, rx.recv()).await {
                Ok(Some((Stream::Stdout, line))) => stdout.push(line),
                Ok(Some((Stream::Stderr, line))) => stderr.push(line),
                Ok(None) => break,
                Err(_) => {
                    debug!(shell = program, "background process still holds step output, detaching");
                    break;
                }
            }
        }
        drop(process);

        Ok(CommandOutput {
            stdout: stdout.join("\n"),
            stderr: stderr.join("\n"),
            exit_code: status.code(),
        })
    }
}

/// Forward a stream line by line until EOF
async fn read_lines<R: AsyncRead + Unpin>(
    stream: Option<R>,
    kind: Stream,
    tx: mpsc::UnboundedSender<(Stream, String)>,
) {
    let Some(stream) = stream else {
        return;
    };

    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send((kind, line)).is_err() {
            break;
        }
    }
}

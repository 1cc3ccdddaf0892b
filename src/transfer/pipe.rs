use std::env;
use std::ffi::OsStr;
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, Command, Stdio};
use std::thread::{self, JoinHandle};

use super::{
    ConfigurationError, Destination, TransferError, TransferExecutor, TransferOutcome,
    TransferPhase, TransferPlan,
};
use crate::catalog::DatasetName;

/// [TransferExecutor] piping `zfs send` into the destination's receive command.
#[derive(Debug, Clone)]
pub struct ZfsSendReceive {
    zfs: PathBuf,
    /// Command prefixed to both sides of the pipeline, e.g. `pfexec`.
    elevate: Option<PathBuf>,
}

impl ZfsSendReceive {
    pub fn new(zfs: impl Into<PathBuf>, elevate: Option<PathBuf>) -> Self {
        Self {
            zfs: zfs.into(),
            elevate,
        }
    }

    fn command(&self, program: impl AsRef<OsStr>) -> Command {
        match &self.elevate {
            Some(elevate) => {
                let mut cmd = Command::new(elevate);
                cmd.arg(program);
                cmd
            }
            None => Command::new(program),
        }
    }
}

impl TransferExecutor for ZfsSendReceive {
    fn validate(&self, destination: &Destination) -> Result<(), ConfigurationError> {
        let program = destination
            .receive_command
            .first()
            .filter(|p| !p.trim().is_empty())
            .ok_or(ConfigurationError::Unset)?;

        let path = resolve_program(Path::new(program))
            .ok_or_else(|| ConfigurationError::NotFound(program.into()))?;
        let mode = path
            .metadata()
            .map_err(|_| ConfigurationError::NotFound(path.clone()))?
            .permissions()
            .mode();

        if mode & 0o111 == 0 {
            return Err(ConfigurationError::NotExecutable(path));
        }
        Ok(())
    }

    fn transfer(
        &self,
        dataset: &DatasetName,
        plan: &TransferPlan,
        destination: &Destination,
    ) -> Result<TransferOutcome, TransferError> {
        let send_args = plan.send_args(dataset).map_err(TransferError::Name)?;
        let (recv_program, recv_args) =
            destination
                .receive_command
                .split_first()
                .ok_or_else(|| TransferError::Spawn {
                    phase: TransferPhase::Receive,
                    source: io::Error::new(io::ErrorKind::InvalidInput, "empty receive command"),
                })?;

        let mut send_cmd = self.command(&self.zfs);
        send_cmd
            .args(&send_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut recv_cmd = self.command(recv_program);
        recv_cmd
            .args(recv_args)
            .stdin(Stdio::piped())
            .stderr(Stdio::piped());

        log::debug!(target: "transfer::pipe", "Running: {send_cmd:?} | {recv_cmd:?}");

        let mut send = send_cmd.spawn().map_err(|source| TransferError::Spawn {
            phase: TransferPhase::Send,
            source,
        })?;
        let mut recv = match recv_cmd.spawn() {
            Ok(recv) => recv,
            Err(source) => {
                reap(&mut send);
                return Err(TransferError::Spawn {
                    phase: TransferPhase::Receive,
                    source,
                });
            }
        };

        // drain stderr concurrently so neither side blocks on a full pipe
        let send_stderr = drain(send.stderr.take());
        let recv_stderr = drain(recv.stderr.take());

        let copied = match (send.stdout.take(), recv.stdin.take()) {
            (Some(mut stream), Some(mut sink)) => io::copy(&mut stream, &mut sink),
            _ => Err(io::Error::other("transfer pipeline is not connected")),
        };
        // stdin of the receiving side is closed at this point, signalling end of stream

        let recv_status = match recv.wait() {
            Ok(status) => status,
            Err(e) => {
                reap(&mut send);
                return Err(TransferError::Pipe(e));
            }
        };
        let send_status = send.wait().map_err(TransferError::Pipe)?;
        let recv_stderr = join(recv_stderr);
        let send_stderr = join(send_stderr);

        if !recv_status.success() {
            return Err(TransferError::Failed {
                phase: TransferPhase::Receive,
                command: format!("{recv_cmd:?}"),
                status: recv_status,
                stderr: recv_stderr,
            });
        }
        if !send_status.success() {
            return Err(TransferError::Failed {
                phase: TransferPhase::Send,
                command: format!("{send_cmd:?}"),
                status: send_status,
                stderr: send_stderr,
            });
        }
        if !send_stderr.is_empty() {
            log::warn!(target: "transfer::pipe", "{}", send_stderr.trim_end());
        }
        if !recv_stderr.is_empty() {
            log::warn!(target: "transfer::pipe", "{}", recv_stderr.trim_end());
        }

        let bytes = copied.map_err(TransferError::Pipe)?;
        log::debug!(target: "transfer::pipe", "Streamed {bytes} bytes of {dataset}");
        Ok(TransferOutcome { bytes })
    }
}

fn drain(stderr: Option<ChildStderr>) -> Option<JoinHandle<String>> {
    stderr.map(|mut stderr| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

fn reap(child: &mut Child) {
    if let Err(e) = child.kill().and_then(|()| child.wait().map(drop)) {
        log::warn!(target: "transfer::pipe", "Unable to stop send command: {e}");
    }
}

/// Resolves a bare program name through `PATH`, like the shell would.
fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.exists().then(|| program.to_path_buf());
    }

    env::var_os("PATH").and_then(|paths| {
        env::split_paths(&paths)
            .map(|dir| dir.join(program))
            .find(|candidate| candidate.is_file())
    })
}

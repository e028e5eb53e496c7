use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};

use crate::error::{Error, Result, TargetDetails, TransferFailedDetails};
use crate::utils::shell;

/// Exit status OpenSSH uses for its own failures (connect, auth, protocol).
const SSH_CLIENT_FAILURE: i32 = 255;

const STREAM_CHUNK: usize = 8 * 1024;

/// Credential/endpoint pair a session is opened against.
///
/// Two targets on the same host with different users are different sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteTarget {
    user: String,
    host: String,
    port: u16,
    identity_file: Option<String>,
    options: BTreeMap<String, String>,
}

impl RemoteTarget {
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port: 22,
            identity_file: None,
            options: BTreeMap::new(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_identity_file(mut self, path: impl Into<String>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// Extra `-o Key=Value` option passed to the ssh client.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn details(&self) -> TargetDetails {
        TargetDetails {
            user: self.user.clone(),
            host: self.host.clone(),
        }
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

/// How a remote shell channel ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelClose {
    /// The remote side reported a numeric exit status.
    Exited(i32),
    /// The channel closed without an exit status.
    Dropped { reason: String },
}

/// Raw result of one channel: close state plus the output already forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOutcome {
    pub close: ChannelClose,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ChannelOutcome {
    pub fn exited(code: i32) -> Self {
        Self {
            close: ChannelClose::Exited(code),
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    pub fn dropped(reason: impl Into<String>) -> Self {
        Self {
            close: ChannelClose::Dropped {
                reason: reason.into(),
            },
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<Vec<u8>>) -> Self {
        self.stdout = stdout.into();
        self
    }
}

/// Network seam: everything that crosses to the remote host goes through here.
pub trait Transport {
    /// Run `script` in a login shell on `target`, streaming its output.
    fn exec(&self, target: &RemoteTarget, script: &str) -> Result<ChannelOutcome>;

    /// Copy a local file byte-for-byte to `remote_path`.
    fn copy(&self, target: &RemoteTarget, local_path: &Path, remote_path: &str) -> Result<()>;
}

impl<T: Transport + ?Sized> Transport for &T {
    fn exec(&self, target: &RemoteTarget, script: &str) -> Result<ChannelOutcome> {
        (**self).exec(target, script)
    }

    fn copy(&self, target: &RemoteTarget, local_path: &Path, remote_path: &str) -> Result<()> {
        (**self).copy(target, local_path, remote_path)
    }
}

/// Production transport backed by the system OpenSSH client (`ssh` and `scp`).
#[derive(Debug, Clone)]
pub struct SshTransport {
    connect_timeout_secs: u64,
}

impl Default for SshTransport {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
        }
    }
}

impl SshTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn common_options(&self, target: &RemoteTarget) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(identity_file) = &target.identity_file {
            args.push("-i".to_string());
            args.push(identity_file.clone());
        }

        // Never block on a password or host-key prompt; fail instead.
        args.extend([
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
        ]);

        for (key, value) in &target.options {
            args.push("-o".to_string());
            args.push(format!("{}={}", key, value));
        }

        args
    }

    pub fn build_ssh_args(&self, target: &RemoteTarget) -> Vec<String> {
        let mut args = self.common_options(target);

        if target.port != 22 {
            args.push("-p".to_string());
            args.push(target.port.to_string());
        }

        args.push(format!("{}@{}", target.user, target.host));
        args.push("bash -l".to_string());
        args
    }

    pub fn build_scp_args(&self, target: &RemoteTarget, local_path: &Path, remote_path: &str) -> Vec<String> {
        let mut args = vec!["-q".to_string()];
        args.extend(self.common_options(target));

        if target.port != 22 {
            args.push("-P".to_string());
            args.push(target.port.to_string());
        }

        let host = if target.host.contains(':') {
            format!("[{}]", target.host)
        } else {
            target.host.clone()
        };

        args.push(local_path.display().to_string());
        args.push(format!("{}@{}:{}", target.user, host, remote_path));
        args
    }
}

impl Transport for SshTransport {
    fn exec(&self, target: &RemoteTarget, script: &str) -> Result<ChannelOutcome> {
        let args = self.build_ssh_args(target);
        let session = ConnectionSession::open(target, &args)?;
        session.run_script(script)
    }

    fn copy(&self, target: &RemoteTarget, local_path: &Path, remote_path: &str) -> Result<()> {
        let args = self.build_scp_args(target, local_path, remote_path);
        log_status!("transfer", "{} -> {}:{}", local_path.display(), target, remote_path);

        let failed = |error: String| {
            Error::transfer_failed(TransferFailedDetails {
                local_path: local_path.display().to_string(),
                remote_path: remote_path.to_string(),
                error,
                target: target.details(),
            })
        };

        let output = Command::new("scp")
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| failed(format!("could not start scp: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let reason = if stderr.is_empty() {
                format!("scp exited with {}", describe_status(output.status))
            } else {
                stderr
            };
            return Err(failed(reason));
        }

        Ok(())
    }
}

/// One live `ssh` client process bound to a single target.
///
/// Dropping the session kills and reaps the client if it is still running,
/// so the connection is released on every exit path.
pub struct ConnectionSession {
    child: Child,
    target: RemoteTarget,
}

impl ConnectionSession {
    pub fn open(target: &RemoteTarget, args: &[String]) -> Result<Self> {
        let child = Command::new("ssh")
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::internal_io(e.to_string(), Some(format!("start ssh to {}", target))))?;

        Ok(Self {
            child,
            target: target.clone(),
        })
    }

    /// Feed `script` to the remote login shell and wait for the channel to close.
    pub fn run_script(mut self, script: &str) -> Result<ChannelOutcome> {
        log_status!("ssh", "{} $ {}", self.target, shell::summarize(script));

        let stdin = self.child.stdin.take();
        let stdout = self.child.stdout.take();
        let stderr = self.child.stderr.take();

        let (stdout, stderr, status) = std::thread::scope(|scope| {
            let out_pump = scope.spawn(move || match stdout {
                Some(reader) => pump(reader, io::stdout()),
                None => Ok(Vec::new()),
            });
            let err_pump = scope.spawn(move || match stderr {
                Some(reader) => pump(reader, io::stderr()),
                None => Ok(Vec::new()),
            });

            // A write failure means the client already went away; the exit
            // status below decides how that is reported.
            if let Some(mut stdin) = stdin {
                let _ = stdin
                    .write_all(script.as_bytes())
                    .and_then(|_| stdin.write_all(b"\nexit\n"))
                    .and_then(|_| stdin.flush());
            }

            let status = self.child.wait();
            let stdout = out_pump.join().unwrap_or_else(|_| Ok(Vec::new()));
            let stderr = err_pump.join().unwrap_or_else(|_| Ok(Vec::new()));
            (stdout, stderr, status)
        });

        let status = status.map_err(|e| {
            Error::internal_io(e.to_string(), Some(format!("wait for ssh to {}", self.target)))
        })?;

        Ok(ChannelOutcome {
            close: classify_exit(status.code()),
            stdout: stdout.unwrap_or_default(),
            stderr: stderr.unwrap_or_default(),
        })
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Map the ssh client's exit code onto the channel close state.
///
/// OpenSSH reports its own failures as 255 and also passes a remote 255
/// through unchanged, so a remote command that really exits 255 is
/// indistinguishable from a lost connection and is reported as `Dropped`.
pub fn classify_exit(code: Option<i32>) -> ChannelClose {
    match code {
        Some(SSH_CLIENT_FAILURE) => ChannelClose::Dropped {
            reason: "ssh exited with status 255 (connection, authentication or protocol failure)"
                .to_string(),
        },
        Some(code) => ChannelClose::Exited(code),
        None => ChannelClose::Dropped {
            reason: "ssh client was terminated by a signal".to_string(),
        },
    }
}

/// Copy `reader` into `sink` chunk by chunk as data arrives, returning everything read.
///
/// Sink write errors (a closed local terminal) are ignored so the remote
/// command still runs to completion.
pub fn pump<R: Read, W: Write>(mut reader: R, mut sink: W) -> io::Result<Vec<u8>> {
    let mut captured = Vec::new();
    let mut buf = [0u8; STREAM_CHUNK];

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        captured.extend_from_slice(&buf[..n]);
        let _ = sink.write_all(&buf[..n]).and_then(|_| sink.flush());
    }

    Ok(captured)
}

fn describe_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}

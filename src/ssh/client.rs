// ABOUTME: SSH connection to one host, authenticated with the trust store's root key.
// ABOUTME: Runs commands and scripts, and moves files over the SCP sink/source protocol.

use super::handler::{HostKeyPolicy, SshHandler};
use super::input;
use super::scp::{self, FileHeader};
use crate::config::{SshConfig, Target};
use crate::error::{Error, ErrorKind, Result};
use crate::trust::TrustStore;
use russh::client::{self, Config, Handle, Msg};
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key};
use russh::{Channel, ChannelMsg, Disconnect};
use std::io::IsTerminal;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader, DuplexStream};

/// Remote directory scripts are staged in before execution.
pub const SCRIPT_DIR: &str = "/tmp";

const SCP: &str = "/usr/bin/scp";

/// Buffer between the channel and the SCP source decoder.
const DOWNLOAD_PIPE_CAPACITY: usize = 64 * 1024;

/// Configuration for establishing an SSH connection.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Remote host to connect to.
    pub host: String,
    /// SSH port (default: 22).
    pub port: u16,
    /// Remote login.
    pub user: String,
    /// Host key verification; accepts any key unless told otherwise.
    pub host_key_policy: HostKeyPolicy,
    /// Idle time after which russh drops the connection.
    pub inactivity_timeout: Duration,
    /// Timeout for captured command execution (default: 5 minutes).
    pub command_timeout: Duration,
    /// Whether inherited sessions read this process's terminal.
    pub forward_stdin: bool,
}

impl ConnectConfig {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
            host_key_policy: HostKeyPolicy::default(),
            inactivity_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(300),
            forward_stdin: true,
        }
    }

    /// Build from a parsed target, filling gaps from the `ssh` settings.
    pub fn from_settings(target: &Target, settings: &SshConfig) -> Self {
        Self::new(target.host.clone(), target.user_or(&settings.user))
            .port(target.port_or(settings.port))
            .host_key_policy(HostKeyPolicy::from_settings(
                settings.host_key,
                settings.known_hosts_path.clone(),
            ))
            .inactivity_timeout(settings.inactivity_timeout)
            .command_timeout(settings.command_timeout)
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = policy;
        self
    }

    pub fn inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Leave stdin alone when several sessions would compete for it.
    pub fn forward_stdin(mut self, forward: bool) -> Self {
        self.forward_stdin = forward;
        self
    }

    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Where a session's standard streams go. Fixed when the session is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stdio {
    /// Pass through to this process's stdout/stderr, and stdin when it is a terminal.
    Inherit,
    /// Collect stdout and stderr in memory.
    Capture,
    /// Discard stdout; stderr is still kept for error reports.
    Null,
}

/// Output from a remote command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code of the command.
    pub exit_code: u32,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// What a drained session produced.
#[derive(Debug, Default)]
struct Drained {
    exit_status: Option<u32>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl Drained {
    fn into_output(self) -> Result<CommandOutput> {
        let exit_code = self
            .exit_status
            .ok_or_else(|| Error::new(ErrorKind::ChannelClosed))?;
        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
        })
    }
}

/// Fail unless the command exited zero, reporting its stderr.
fn require_success(command: &str, output: CommandOutput) -> Result<CommandOutput> {
    if output.success() {
        Ok(output)
    } else {
        Err(Error::new(ErrorKind::CommandFailed {
            command: command.to_string(),
            exit_status: Some(output.exit_code),
            stderr: output.stderr.trim_end().to_string(),
        }))
    }
}

fn quote(arg: &str) -> String {
    shell_escape::unix::escape(arg.into()).into_owned()
}

fn file_name(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| Error::msg(format!("{} has no usable file name", path.display())))
}

/// An authenticated SSH connection to one host.
///
/// Every operation opens its own session (an SSH channel), drives it to
/// completion and closes it before returning, so operations on one client
/// never overlap.
pub struct Client {
    config: ConnectConfig,
    handle: Handle<SshHandler>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("handle", &"<russh::Handle>")
            .finish()
    }
}

impl Client {
    /// Connect and authenticate with the trust store's root key.
    ///
    /// The store must already hold its root material. A throwaway session is
    /// opened and closed to prove the connection is usable.
    pub async fn connect(config: ConnectConfig, store: &TrustStore) -> Result<Self> {
        let key_path = store.root_key_pem().require()?.to_path_buf();
        let key = load_secret_key(&key_path, None).map_err(|e| {
            Error::with_context(
                format!(
                    "ssh: cannot parse key {} for host {}",
                    key_path.display(),
                    config.host
                ),
                Error::from(e),
            )
        })?;

        let russh_config = Config {
            inactivity_timeout: Some(config.inactivity_timeout),
            ..Default::default()
        };

        let handler = SshHandler::new(
            config.host.clone(),
            config.port,
            config.host_key_policy.clone(),
        );

        let mut handle = client::connect(
            Arc::new(russh_config),
            (config.host.as_str(), config.port),
            handler,
        )
        .await
        .map_err(|e| {
            Error::new(ErrorKind::Connection(format!(
                "cannot connect to {} with user {}: {}",
                config.host_port(),
                config.user,
                e
            )))
        })?;

        let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
        let auth = handle
            .authenticate_publickey(
                &config.user,
                PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
            )
            .await?;
        if !auth.success() {
            return Err(Error::new(ErrorKind::AuthenticationFailed {
                user: config.user.clone(),
            }));
        }

        let client = Self { config, handle };
        let probe = client.open_session().await?;
        if let Err(e) = probe.close().await {
            tracing::warn!(
                "validation session for {} did not close cleanly: {}",
                client.config.host_port(),
                e
            );
        }
        tracing::debug!("connected to {}", client.config.host_port());
        Ok(client)
    }

    pub fn config(&self) -> &ConnectConfig {
        &self.config
    }

    async fn open_session(&self) -> Result<Channel<Msg>> {
        self.handle.channel_open_session().await.map_err(|e| {
            Error::new(ErrorKind::Session(format!(
                "cannot create a session for {}: {}",
                self.config.host_port(),
                e
            )))
        })
    }

    async fn start(&self, command: &str) -> Result<Channel<Msg>> {
        let channel = self.open_session().await?;
        tracing::debug!("{}: {}", self.config.host_port(), command);
        if let Err(e) = channel.exec(true, command).await {
            let failed = Err(Error::new(ErrorKind::Session(format!(
                "cannot start [{command}]: {e}"
            ))));
            return release(channel, failed).await;
        }
        Ok(channel)
    }

    /// Run `command` with the given stdio wiring and return what it produced.
    pub async fn run_with(&self, command: &str, stdio: Stdio) -> Result<CommandOutput> {
        let mut channel = self.start(command).await?;

        let interactive = stdio == Stdio::Inherit
            && self.config.forward_stdin
            && std::io::stdin().is_terminal();
        let stdin_forwarder =
            interactive.then(|| input::forward_stdin(Box::pin(channel.make_writer())));

        let drained = drain(&mut channel, stdio, None).await;

        if let Some(forwarder) = stdin_forwarder {
            forwarder.abort();
        }

        let output = release(channel, drained).await?.into_output()?;
        Ok(output)
    }

    /// Execute a command, capturing its output. Non-zero exits are returned,
    /// not treated as errors.
    pub async fn exec(&self, command: &str) -> Result<CommandOutput> {
        self.exec_with_timeout(command, self.config.command_timeout)
            .await
    }

    /// Execute a command with a custom timeout.
    pub async fn exec_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        match tokio::time::timeout(timeout, self.run_with(command, Stdio::Capture)).await {
            Ok(result) => result,
            Err(_) => Err(Error::new(ErrorKind::CommandTimeout(timeout))),
        }
    }

    /// Run a command with the remote streams wired to this process.
    pub async fn run_command(&self, command: &str) -> Result<()> {
        let output = self.run_with(command, Stdio::Inherit).await?;
        require_success(command, output).map(drop)
    }

    /// Run a command, discarding its output.
    pub async fn run_command_quiet(&self, command: &str) -> Result<()> {
        let output = self.run_with(command, Stdio::Null).await?;
        require_success(command, output).map(drop)
    }

    /// Run a command and return its stdout; a failure carries its stderr.
    pub async fn run_command_to_out(&self, command: &str) -> Result<String> {
        let output = self.exec(command).await?;
        require_success(command, output).map(|output| output.stdout)
    }

    /// Upload `script` to the remote `/tmp` and run it with `sudo bash`.
    pub async fn run_script(&self, script: &str) -> Result<()> {
        self.run_script_with(script, Stdio::Inherit).await
    }

    pub async fn run_script_quiet(&self, script: &str) -> Result<()> {
        self.run_script_with(script, Stdio::Null).await
    }

    async fn run_script_with(&self, script: &str, stdio: Stdio) -> Result<()> {
        let local = tempfile::Builder::new()
            .prefix("hostwire-")
            .suffix(".sh")
            .tempfile()
            .map_err(|e| Error::io("cannot create temporary script", e))?;

        let ran = match tokio::fs::write(local.path(), script).await {
            Ok(()) => self.run_staged_script(local.path(), stdio).await,
            Err(e) => Err(Error::io(
                format!("cannot write {}", local.path().display()),
                e,
            )),
        };

        let deleted = local
            .close()
            .map_err(|e| Error::io("cannot delete temporary script", e));
        Error::combine(ran, deleted)
    }

    async fn run_staged_script(&self, local: &Path, stdio: Stdio) -> Result<()> {
        self.upload(local, SCRIPT_DIR).await?;
        let remote = format!("{}/{}", SCRIPT_DIR, file_name(local)?);
        let command = format!("sudo bash {}", quote(&remote));
        let output = self.run_with(&command, stdio).await?;
        require_success(&command, output).map(drop)
    }

    /// Copy `local` into `remote_dir`, creating the directory with sudo.
    ///
    /// The transfer succeeds only if the remote `scp` exits zero.
    pub async fn upload(&self, local: &Path, remote_dir: &str) -> Result<()> {
        self.run_command_quiet(&format!("sudo mkdir -p {}", quote(remote_dir)))
            .await?;

        let io_err = |e| Error::io(format!("cannot read {}", local.display()), e);
        let file = tokio::fs::File::open(local).await.map_err(io_err)?;
        let metadata = file.metadata().await.map_err(io_err)?;
        let header = FileHeader::new(
            metadata.permissions().mode(),
            metadata.len(),
            file_name(local)?,
        );

        let command = format!("sudo {SCP} -tr {}", quote(remote_dir));
        let mut channel = self.start(&command).await?;
        let mut stdin = Box::pin(channel.make_writer());

        let (sent, drained) = tokio::join!(
            async {
                let sent = scp::send_file(&mut stdin, &header, file).await;
                let closed = stdin
                    .shutdown()
                    .await
                    .map_err(|e| Error::io("cannot close scp stdin", e));
                Error::combine(sent, closed)
            },
            drain(&mut channel, Stdio::Capture, None),
        );

        let finished = drained.and_then(|d| remote_outcome(&command, d));
        let result = Error::combine(sent, finished);
        release(channel, result).await?;
        tracing::debug!(
            "uploaded {} to {}:{}",
            local.display(),
            self.config.host_port(),
            remote_dir
        );
        Ok(())
    }

    /// Copy `remote_file` into `local_dir`, creating the directory if needed.
    /// Returns the path of the downloaded file.
    ///
    /// A failed download may leave a partial file behind; callers discard it.
    pub async fn download(&self, remote_file: &str, local_dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(local_dir)
            .await
            .map_err(|e| Error::io(format!("cannot create {}", local_dir.display()), e))?;

        let command = format!("sudo {SCP} -f {}", quote(remote_file));
        let mut channel = self.start(&command).await?;
        let mut acks = Box::pin(channel.make_writer());
        let (pipe_in, pipe_out) = tokio::io::duplex(DOWNLOAD_PIPE_CAPACITY);

        let (drained, received) = tokio::join!(
            drain(&mut channel, Stdio::Capture, Some(pipe_in)),
            async {
                let received = receive_into(pipe_out, &mut acks, local_dir).await;
                if received.is_err() {
                    // The source waits for acks; EOF on its stdin makes it exit.
                    let _ = acks.shutdown().await;
                }
                received
            },
        );

        let finished = drained.and_then(|d| remote_outcome(&command, d));
        let path = release(channel, Error::combine(received, finished)).await?;
        tracing::debug!(
            "downloaded {}:{} to {}",
            self.config.host_port(),
            remote_file,
            path.display()
        );
        Ok(path)
    }

    /// Disconnect from the host.
    pub async fn close(&self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }
}

/// Decode one file from the source stream into `local_dir`.
async fn receive_into<W>(pipe: DuplexStream, acks: &mut W, local_dir: &Path) -> Result<PathBuf>
where
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let header = scp::read_header(&mut reader, acks).await?;
    let path = local_dir.join(&header.name);

    let io_err = |e| Error::io(format!("cannot write {}", path.display()), e);
    let mut file = tokio::fs::File::create(&path).await.map_err(io_err)?;
    scp::read_body(&mut reader, acks, &header, &mut file).await?;
    file.sync_all().await.map_err(io_err)?;
    tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(header.mode))
        .await
        .map_err(io_err)?;
    Ok(path)
}

/// Turn the remote scp's exit into a result.
fn remote_outcome(command: &str, drained: Drained) -> Result<()> {
    let Drained {
        exit_status,
        stdout,
        stderr,
    } = drained;
    if exit_status == Some(0) {
        return Ok(());
    }
    // scp reports its own failures in-band on stdout, behind a control byte.
    let mut report = String::from_utf8_lossy(&stderr).trim_end().to_string();
    if report.is_empty() {
        report = String::from_utf8_lossy(&stdout)
            .trim_matches(|c: char| c.is_control() || c.is_whitespace())
            .to_string();
    }
    Err(Error::new(ErrorKind::CommandFailed {
        command: command.to_string(),
        exit_status,
        stderr: report,
    }))
}

/// Read channel messages until the remote command is done.
///
/// With `pipe` set, stdout is forwarded into it instead of following
/// `stdio`; the pipe is dropped at end of output so its reader sees EOF.
async fn drain(
    channel: &mut Channel<Msg>,
    stdio: Stdio,
    mut pipe: Option<DuplexStream>,
) -> Result<Drained> {
    let mut drained = Drained::default();
    let mut local_stdout = tokio::io::stdout();
    let mut local_stderr = tokio::io::stderr();
    let mut got_eof = false;

    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => {
                if let Some(sink) = pipe.as_mut() {
                    if sink.write_all(&data).await.is_err() {
                        // Decoder gave up; keep draining for the exit status.
                        pipe = None;
                    }
                    continue;
                }
                match stdio {
                    Stdio::Inherit => local_stdout
                        .write_all(&data)
                        .await
                        .map_err(|e| Error::io("cannot write to stdout", e))?,
                    Stdio::Capture => drained.stdout.extend_from_slice(&data),
                    Stdio::Null => {}
                }
            }
            Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                if stdio == Stdio::Inherit {
                    local_stderr
                        .write_all(&data)
                        .await
                        .map_err(|e| Error::io("cannot write to stderr", e))?;
                }
                drained.stderr.extend_from_slice(&data);
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                drained.exit_status = Some(exit_status);
                if got_eof {
                    break;
                }
            }
            Some(ChannelMsg::Eof) => {
                got_eof = true;
                pipe = None;
                if drained.exit_status.is_some() {
                    break;
                }
            }
            Some(ChannelMsg::Close) => break,
            Some(_) => {}
            None => break,
        }
    }

    if stdio == Stdio::Inherit {
        let _ = local_stdout.flush().await;
        let _ = local_stderr.flush().await;
    }
    Ok(drained)
}

/// Close a session, merging a close failure with the session's result.
/// A close failure after success is only logged: the work is done.
async fn release<T>(channel: Channel<Msg>, result: Result<T>) -> Result<T> {
    let closed = channel.close().await;
    match (result, closed) {
        (Ok(value), Err(e)) => {
            tracing::warn!("session finished but closing it failed: {}", e);
            Ok(value)
        }
        (result, closed) => Error::combine(
            result,
            closed.map_err(|e| Error::new(ErrorKind::Session(format!("cannot close session: {e}")))),
        ),
    }
}

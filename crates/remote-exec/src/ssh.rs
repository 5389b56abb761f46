//! SSH transport implementation
//!
//! russh-backed `Connector`/`Transport` for real fleet hosts. Commands run
//! over exec channels; file content is streamed through `cat` rather than
//! quoted into a shell line, so arbitrary bytes survive the trip.

use crate::error::{RemoteExecError, RemoteExecResult};
use crate::transport::{CommandOutput, Connector, Transport};
use async_trait::async_trait;
use ops_core::{AuthMethod, Host};
use russh::client;
use russh_keys::key::{KeyPair, PublicKey};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Client handler accepting the server key
///
/// Host key verification is delegated to fleet provisioning; the executor
/// talks to hosts the operator registered explicitly.
struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Connector opening russh sessions
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    /// Keepalive interval for opened sessions, if any
    inactivity_timeout: Option<Duration>,
}

impl SshConnector {
    /// Create a connector with default session settings
    #[must_use]
    pub fn new() -> Self {
        Self {
            inactivity_timeout: Some(Duration::from_secs(300)),
        }
    }

    async fn authenticate(
        &self,
        session: &mut client::Handle<ClientHandler>,
        host: &Host,
    ) -> RemoteExecResult<bool> {
        let map_err = |e: russh::Error| RemoteExecError::ConnectError {
            host: host.pool_key(),
            reason: e.to_string(),
        };

        match &host.auth {
            AuthMethod::PasswordEnv { var } => {
                let password =
                    std::env::var(var).map_err(|_| RemoteExecError::ConnectError {
                        host: host.pool_key(),
                        reason: format!("environment variable {var} is not set"),
                    })?;
                session
                    .authenticate_password(&host.user, &password)
                    .await
                    .map_err(map_err)
            }
            AuthMethod::KeyFile { path } => {
                let key = load_private_key(path, &host.pool_key()).await?;
                session
                    .authenticate_publickey(&host.user, Arc::new(key))
                    .await
                    .map_err(map_err)
            }
            AuthMethod::DefaultKeys => {
                let home = dirs::home_dir().ok_or_else(|| RemoteExecError::ConnectError {
                    host: host.pool_key(),
                    reason: "cannot determine home directory for default keys".to_string(),
                })?;
                for name in ["id_ed25519", "id_rsa", "id_ecdsa"] {
                    let key_path = home.join(".ssh").join(name);
                    if !key_path.exists() {
                        continue;
                    }
                    let Ok(key) = load_private_key(&key_path, &host.pool_key()).await else {
                        continue;
                    };
                    match session
                        .authenticate_publickey(&host.user, Arc::new(key))
                        .await
                    {
                        Ok(true) => return Ok(true),
                        Ok(false) => continue,
                        Err(e) => {
                            debug!(host = %host.hostname, key = name, error = %e, "key auth attempt failed");
                            continue;
                        }
                    }
                }
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        host: &Host,
        timeout: Duration,
    ) -> RemoteExecResult<Box<dyn Transport>> {
        let config = Arc::new(client::Config {
            inactivity_timeout: self.inactivity_timeout,
            ..Default::default()
        });

        let stream = tokio::time::timeout(timeout, TcpStream::connect(host.address()))
            .await
            .map_err(|_| RemoteExecError::ConnectError {
                host: host.pool_key(),
                reason: format!("connect timed out after {}ms", timeout.as_millis()),
            })?
            .map_err(|e| RemoteExecError::ConnectError {
                host: host.pool_key(),
                reason: e.to_string(),
            })?;

        let mut session = client::connect_stream(config, stream, ClientHandler)
            .await
            .map_err(|e| RemoteExecError::ConnectError {
                host: host.pool_key(),
                reason: e.to_string(),
            })?;

        let authenticated = self.authenticate(&mut session, host).await?;
        if !authenticated {
            return Err(RemoteExecError::AuthFailed {
                user: host.user.clone(),
                host: host.pool_key(),
            });
        }

        debug!(host = %host, "ssh session established");
        Ok(Box::new(SshTransport {
            handle: session,
            host: host.pool_key(),
        }))
    }
}

/// Live russh session bound to one host
pub struct SshTransport {
    handle: client::Handle<ClientHandler>,
    host: String,
}

#[async_trait]
impl Transport for SshTransport {
    async fn exec(&self, command: &str) -> RemoteExecResult<CommandOutput> {
        let mut channel = self.handle.channel_open_session().await.map_err(|_| {
            RemoteExecError::ChannelClosed {
                host: self.host.clone(),
            }
        })?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| RemoteExecError::CommandFailed {
                host: self.host.clone(),
                reason: e.to_string(),
            })?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        // Collect until the channel closes; stdout/stderr are complete by then.
        loop {
            match channel.wait().await {
                Some(russh::ChannelMsg::Data { data }) => {
                    stdout.extend_from_slice(&data);
                }
                Some(russh::ChannelMsg::ExtendedData { data, ext }) => {
                    if ext == 1 {
                        stderr.extend_from_slice(&data);
                    }
                }
                Some(russh::ChannelMsg::ExitStatus { exit_status }) => {
                    exit_code = Some(exit_status);
                }
                Some(russh::ChannelMsg::Eof) => {}
                Some(russh::ChannelMsg::Close) | None => break,
                _ => {}
            }
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            exit_code,
        })
    }

    async fn upload(&self, remote_path: &str, content: &[u8]) -> RemoteExecResult<()> {
        let mut channel = self.handle.channel_open_session().await.map_err(|_| {
            RemoteExecError::ChannelClosed {
                host: self.host.clone(),
            }
        })?;

        let map_err = |e: russh::Error| RemoteExecError::UploadFailed {
            host: self.host.clone(),
            reason: e.to_string(),
        };

        channel
            .exec(true, format!("cat > '{remote_path}'"))
            .await
            .map_err(map_err)?;
        channel.data(content).await.map_err(map_err)?;
        channel.eof().await.map_err(map_err)?;

        let mut exit_code = None;
        loop {
            match channel.wait().await {
                Some(russh::ChannelMsg::ExitStatus { exit_status }) => {
                    exit_code = Some(exit_status);
                }
                Some(russh::ChannelMsg::Close) | None => break,
                _ => {}
            }
        }

        if exit_code.unwrap_or(0) != 0 {
            return Err(RemoteExecError::UploadFailed {
                host: self.host.clone(),
                reason: format!("remote write exited {}", exit_code.unwrap_or(0)),
            });
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            warn!(host = %self.host, error = %e, "disconnect failed");
        }
    }
}

/// Load a private key from file
async fn load_private_key(path: &Path, host: &str) -> RemoteExecResult<KeyPair> {
    let content =
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RemoteExecError::ConnectError {
                host: host.to_string(),
                reason: format!("failed to read key file {}: {e}", path.display()),
            })?;

    russh_keys::decode_secret_key(&content, None).map_err(|e| RemoteExecError::ConnectError {
        host: host.to_string(),
        reason: format!("failed to decode private key {}: {e}", path.display()),
    })
}

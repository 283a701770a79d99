//! Password-authenticated SSH connection over libssh2

use crate::{ConnectionInfo, HostKey, HostKeyPolicy, SshConfig, Transport, TransportError, TransportType, CommandOutput};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use ssh2::{Channel, CheckResult, ErrorCode, KnownHostFileKind, Session};
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// libssh2 error codes that decide how a userauth failure is reported
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_PASSWORD_EXPIRED: i32 = -15;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

const CHANNEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// An authenticated libssh2 session
pub struct Connection {
    /// libssh2 session, cheap to clone
    session: Session,
    /// Configuration the session was opened with
    config: SshConfig,
    /// Key the server presented during the handshake
    host_key: HostKey,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("target", &self.config.target())
            .field("port", &self.config.port)
            .field("host_key", &self.host_key.fingerprint())
            .finish()
    }
}

impl Connection {
    /// Open a session and authenticate with a password.
    ///
    /// The TCP connect, handshake and authentication all share
    /// `config.connect_timeout`. The host key is checked against
    /// `config.host_key_policy` before the password is sent.
    pub async fn connect_password(config: &SshConfig, password: &SecretString) -> Result<Self, TransportError> {
        info!("Connecting to {}@{}:{}", config.username, config.host, config.port);

        let config = config.clone();
        let password = password.clone();

        tokio::task::spawn_blocking(move || Self::connect_blocking(config, password))
            .await
            .map_err(|e| TransportError::Ssh(format!("connect task failed: {}", e)))?
    }

    fn connect_blocking(config: SshConfig, password: SecretString) -> Result<Self, TransportError> {
        let stream = open_tcp_stream(&config)?;

        let mut session = Session::new()
            .map_err(|e| TransportError::Ssh(format!("Failed to create session: {}", e)))?;
        session.set_timeout(duration_millis(config.connect_timeout));
        session.set_tcp_stream(stream);
        session.handshake()
            .map_err(|e| TransportError::Connection(format!("SSH handshake failed: {}", e)))?;

        let host_key = verify_host_key(&session, &config)?;

        session.userauth_password(&config.username, password.expose_secret())
            .map_err(classify_auth_error)?;
        if !session.authenticated() {
            return Err(TransportError::Authentication(format!(
                "server did not accept the password for {}",
                config.username
            )));
        }

        session.set_timeout(duration_millis(config.command_timeout));
        info!("Authenticated as {}@{}", config.username, config.host);

        Ok(Self { session, config, host_key })
    }

    /// Host key the server presented
    pub fn host_key(&self) -> &HostKey {
        &self.host_key
    }

    /// Close the session
    pub fn close(self) {
        debug!("Closing SSH session to {}", self.config.host);
        if let Err(e) = self.session.disconnect(None, "bootstrap complete", None) {
            warn!("Error closing SSH session: {}", e);
        }
    }
}

#[async_trait]
impl Transport for Connection {
    async fn execute(&self, command: &str) -> Result<CommandOutput, TransportError> {
        debug!("Executing remote command: {}", command);

        let session = self.session.clone();
        let command = command.to_string();

        tokio::task::spawn_blocking(move || exec_blocking(&session, &command))
            .await
            .map_err(|e| TransportError::Ssh(format!("exec task failed: {}", e)))?
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            host: self.config.host.clone(),
            port: self.config.port,
            username: self.config.username.clone(),
            transport_type: TransportType::SshLibssh2,
        }
    }
}

fn open_tcp_stream(config: &SshConfig) -> Result<TcpStream, TransportError> {
    let addrs = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| TransportError::Connection(format!("cannot resolve {}: {}", config.host, e)))?;

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, config.connect_timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("Connect to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    Err(match last_error {
        Some(e) if e.kind() == io::ErrorKind::TimedOut => TransportError::Timeout(config.connect_timeout),
        Some(e) => TransportError::Connection(format!("cannot connect to {}:{}: {}", config.host, config.port, e)),
        None => TransportError::Connection(format!("no addresses found for {}", config.host)),
    })
}

fn verify_host_key(session: &Session, config: &SshConfig) -> Result<HostKey, TransportError> {
    let (blob, _) = session.host_key()
        .ok_or_else(|| TransportError::Connection("server did not present a host key".to_string()))?;
    let host_key = HostKey::from_bytes(blob)?;
    let rejected = |reason: String| TransportError::HostKey { host: config.host.clone(), reason };

    match &config.host_key_policy {
        HostKeyPolicy::TrustOnFirstUse => {
            warn!("Trusting host key {} for {} without verification", host_key.fingerprint(), config.host);
        }
        HostKeyPolicy::KnownHosts(path) => {
            let mut known_hosts = session.known_hosts()
                .map_err(|e| TransportError::Ssh(e.to_string()))?;
            known_hosts.read_file(path, KnownHostFileKind::OpenSSH)
                .map_err(|e| TransportError::Configuration(format!("cannot read {}: {}", path.display(), e)))?;
            match known_hosts.check_port(&config.host, config.port, blob) {
                CheckResult::Match => debug!("Host key matches {}", path.display()),
                CheckResult::Mismatch => {
                    return Err(rejected(format!("key {} differs from the one in {}", host_key.fingerprint(), path.display())));
                }
                CheckResult::NotFound => {
                    return Err(rejected(format!("host not listed in {}", path.display())));
                }
                CheckResult::Failure => {
                    return Err(rejected("known_hosts lookup failed".to_string()));
                }
            }
        }
        HostKeyPolicy::Pinned(expected) => {
            if !host_key.matches_fingerprint(expected) {
                return Err(rejected(format!("fingerprint {} does not match pinned {}", host_key.fingerprint(), expected)));
            }
        }
    }

    Ok(host_key)
}

fn classify_auth_error(err: ssh2::Error) -> TransportError {
    match err.code() {
        ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED)
        | ErrorCode::Session(LIBSSH2_ERROR_PASSWORD_EXPIRED) => {
            TransportError::Authentication(err.message().to_string())
        }
        ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => {
            TransportError::Connection(format!("timed out during authentication: {}", err.message()))
        }
        ErrorCode::Session(LIBSSH2_ERROR_SOCKET_SEND)
        | ErrorCode::Session(LIBSSH2_ERROR_SOCKET_RECV)
        | ErrorCode::Session(LIBSSH2_ERROR_SOCKET_DISCONNECT) => {
            TransportError::Connection(err.message().to_string())
        }
        _ => TransportError::Ssh(err.to_string()),
    }
}

fn exec_blocking(session: &Session, command: &str) -> Result<CommandOutput, TransportError> {
    let ssh_err = |e: ssh2::Error| TransportError::Ssh(e.to_string());

    let mut channel = session.channel_session().map_err(ssh_err)?;
    channel.exec(command).map_err(ssh_err)?;

    // Both streams are drained together so a full stderr window cannot
    // stall the stdout read
    session.set_blocking(false);
    let drained = drain_channel(session, &channel);
    session.set_blocking(true);
    let (stdout, stderr) = drained?;

    channel.wait_close().map_err(ssh_err)?;
    let exit_code = channel.exit_status().map_err(ssh_err)?;

    Ok(CommandOutput {
        exit_code,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

fn drain_channel(session: &Session, channel: &Channel) -> Result<(Vec<u8>, Vec<u8>), TransportError> {
    let deadline = match session.timeout() {
        0 => None,
        millis => Some(Instant::now() + Duration::from_millis(u64::from(millis))),
    };

    let mut out_stream = channel.stream(0);
    let mut err_stream = channel.stderr();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    loop {
        let out_progress = read_available(&mut out_stream, &mut stdout)?;
        let err_progress = read_available(&mut err_stream, &mut stderr)?;
        if out_progress || err_progress {
            continue;
        }
        if channel.eof() {
            return Ok((stdout, stderr));
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(TransportError::Timeout(Duration::from_millis(u64::from(session.timeout()))));
        }
        std::thread::sleep(CHANNEL_POLL_INTERVAL);
    }
}

/// Read whatever `stream` has buffered; true when any bytes arrived
fn read_available(stream: &mut impl Read, buf: &mut Vec<u8>) -> io::Result<bool> {
    let mut chunk = [0u8; 8192];
    let mut progress = false;
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => return Ok(progress),
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                progress = true;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(progress),
            Err(e) => return Err(e),
        }
    }
}

fn duration_millis(duration: std::time::Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    // Replays chunks, then reports WouldBlock like a non-blocking channel
    struct Pending(VecDeque<&'static [u8]>);

    impl Read for Pending {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(chunk);
                    Ok(chunk.len())
                }
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    #[test]
    fn test_read_available_stops_at_would_block() {
        let mut stream = Pending(VecDeque::from([&b"permission "[..], &b"denied\n"[..]]));
        let mut buf = Vec::new();

        assert!(read_available(&mut stream, &mut buf).unwrap());
        assert_eq!(buf, b"permission denied\n");
        assert!(!read_available(&mut stream, &mut buf).unwrap());
    }

    #[test]
    fn test_read_available_at_eof() {
        let mut buf = Vec::new();
        assert!(!read_available(&mut io::empty(), &mut buf).unwrap());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_classify_auth_failure() {
        let err = ssh2::Error::new(ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED), "bad password");
        assert!(matches!(classify_auth_error(err), TransportError::Authentication(_)));
    }

    #[test]
    fn test_classify_socket_failure() {
        let err = ssh2::Error::new(ErrorCode::Session(LIBSSH2_ERROR_SOCKET_DISCONNECT), "gone");
        assert!(matches!(classify_auth_error(err), TransportError::Connection(_)));
    }

    #[test]
    fn test_classify_other_failure() {
        let err = ssh2::Error::new(ErrorCode::Session(-1), "boom");
        assert!(matches!(classify_auth_error(err), TransportError::Ssh(_)));
    }

    #[test]
    fn test_duration_millis_saturates() {
        assert_eq!(duration_millis(Duration::from_secs(5)), 5000);
        assert_eq!(duration_millis(Duration::from_secs(u64::MAX / 1000)), u32::MAX);
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        // Bind then drop to get a port nothing listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = SshConfig {
            host: "127.0.0.1".to_string(),
            port,
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        };

        let result = Connection::connect_password(&config, &SecretString::new("secret".to_string())).await;
        assert!(matches!(result, Err(TransportError::Connection(_))));
    }

    #[tokio::test]
    async fn test_handshake_failure_is_connection_error() {
        // A peer that closes immediately without speaking SSH.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let config = SshConfig {
            host: "127.0.0.1".to_string(),
            port,
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        };

        let result = Connection::connect_password(&config, &SecretString::new("secret".to_string())).await;
        assert!(matches!(result, Err(TransportError::Connection(_))));
        server.join().unwrap();
    }
}

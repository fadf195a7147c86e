//! OpenVPN management interface client.
//!
//! The daemon is started with `--management 127.0.0.1 <port>` and listens on
//! the loopback interface. Once attached, the client enables real-time
//! `>STATE:` and `>BYTECOUNT:` notifications, releases the management hold
//! and answers password challenges with the session's [`AuthCredential`].
//!
//! Parsed updates are forwarded to the owner as [`SessionEvent`]s over an
//! unbounded channel, in the order the daemon emitted them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ProtocolError, VpnctlError, VpnctlResult};
use super::state::{AuthCredential, CredentialKind, Phase, StateReport};

/// Address the daemon's management interface binds to
pub const MANAGEMENT_HOST: &str = "127.0.0.1";

const PRIVATE_KEY_CHALLENGE: &str = "Need 'Private Key' password";
const AUTH_CHALLENGE: &str = "Need 'Auth' username/password";

/// Longest management line kept; longer lines are dropped whole
const MAX_LINE_LENGTH: u64 = 64 * 1024;

/// Commands understood by the management interface
pub struct ManagementCommands;

impl ManagementCommands {
    pub const STATE_ON: &'static str = "state on";
    pub const BYTECOUNT: &'static str = "bytecount 1";
    pub const HOLD_RELEASE: &'static str = "hold release";
    pub const QUIT: &'static str = "quit";

    pub fn username(realm: &str, username: &str) -> String {
        format!("username \"{}\" {}", realm, json_quote(username))
    }

    pub fn password(realm: &str, password: &str) -> String {
        format!("password \"{}\" {}", realm, json_quote(password))
    }
}

fn json_quote(value: &str) -> String {
    serde_json::Value::from(value).to_string()
}

/// A real-time notification the client acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    ByteCount { received: u64, sent: u64 },
    Hold,
    Password(String),
    State(StateReport),
}

/// Parse one line of management output.
///
/// Returns `None` for anything that is not an actionable `>CMD:params`
/// notification: short lines, command responses, `>LOG:`/`>INFO:`, unknown
/// keywords and malformed parameters.
pub fn parse_notification(line: &str) -> Option<Notification> {
    let line = line.trim();
    if line.len() < 3 {
        return None;
    }

    let rest = line.strip_prefix('>')?;
    let (command, params) = rest.split_once(':')?;

    match command.trim().to_lowercase().as_str() {
        "bytecount" => parse_bytecount(params),
        "hold" => Some(Notification::Hold),
        "password" => Some(Notification::Password(params.to_string())),
        "state" => parse_state(params),
        "log" | "info" => None,
        other => {
            debug!("Ignoring management notification '{}'", other);
            None
        }
    }
}

fn parse_bytecount(params: &str) -> Option<Notification> {
    let mut fields = params.split(',');
    let received = fields.next()?.trim().parse().ok()?;
    let sent = fields.next()?.trim().parse().ok()?;
    Some(Notification::ByteCount { received, sent })
}

fn parse_state(params: &str) -> Option<Notification> {
    let fields: Vec<&str> = params.split(',').collect();
    if fields.len() < 5 {
        debug!("Dropping STATE notification with {} fields", fields.len());
        return None;
    }

    let observed_at = fields[0].trim().parse().ok()?;
    let phase = match fields[1].parse::<Phase>() {
        Ok(phase) => phase,
        Err(unknown) => {
            debug!("Dropping STATE notification with unrecognized phase '{}'", unknown.0);
            return None;
        }
    };

    Some(Notification::State(StateReport {
        observed_at,
        phase,
        detail: fields[2].to_string(),
        local_address: fields[3].to_string(),
        remote_address: fields[4].to_string(),
    }))
}

/// Updates forwarded from an attached session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    State(StateReport),
    Bandwidth { bytes_received: u64, bytes_sent: u64 },
    /// Fatal protocol failure; the transport has been destroyed
    Failed(ProtocolError),
    /// The daemon closed the socket or the read side failed
    Disconnected(String),
}

type SharedWriter = Arc<Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>>;

async fn write_line(writer: &SharedWriter, command: &str) -> Result<(), ProtocolError> {
    let mut guard = writer.lock().await;
    let sink = guard.as_mut().ok_or(ProtocolError::NotConnected)?;

    let data = format!("{}\r\n", command);
    sink.write_all(data.as_bytes())
        .await
        .map_err(|e| ProtocolError::ConnectionReset(e.to_string()))?;
    sink.flush()
        .await
        .map_err(|e| ProtocolError::ConnectionReset(e.to_string()))?;

    // Only the keyword: arguments may carry secrets
    debug!("Sent management command '{}'", command.split_whitespace().next().unwrap_or(""));
    Ok(())
}

/// An attached management-interface connection
pub struct ManagementSession {
    writer: SharedWriter,
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl ManagementSession {
    /// Attach to an already-connected transport.
    ///
    /// Sends the notification setup commands before the reader starts, so
    /// nothing from the daemon is dispatched ahead of them.
    pub async fn attach<S>(
        stream: S,
        auth: AuthCredential,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let writer: SharedWriter = Arc::new(Mutex::new(Some(Box::new(writer))));

        write_line(&writer, ManagementCommands::STATE_ON).await?;
        write_line(&writer, ManagementCommands::BYTECOUNT).await?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn(read_loop(reader, writer.clone(), auth, open.clone(), event_tx));

        Ok((
            Self {
                writer,
                open,
                reader,
            },
            event_rx,
        ))
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub async fn send(&self, command: &str) -> Result<(), ProtocolError> {
        if !self.is_open() {
            return Err(ProtocolError::NotConnected);
        }
        write_line(&self.writer, command).await
    }

    /// Send `quit` if still open, then tear the transport down
    pub async fn close(&mut self) {
        if self.open.swap(false, Ordering::SeqCst) {
            if let Err(e) = write_line(&self.writer, ManagementCommands::QUIT).await {
                debug!("Could not send quit to management interface: {}", e);
            }
        }
        self.reader.abort();
        self.writer.lock().await.take();
    }
}

impl Drop for ManagementSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop<R>(
    reader: R,
    writer: SharedWriter,
    auth: AuthCredential,
    open: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<SessionEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let mut oversized = false;

    let outcome = loop {
        line.clear();
        match (&mut reader).take(MAX_LINE_LENGTH).read_until(b'\n', &mut line).await {
            Ok(0) => break SessionEvent::Disconnected("end of stream".to_string()),
            Ok(_) => {
                if line.last() != Some(&b'\n') {
                    // Either the limit was hit or this is the tail of a stream that just ended
                    if line.len() as u64 >= MAX_LINE_LENGTH && !oversized {
                        debug!("Dropping management line longer than {} bytes", MAX_LINE_LENGTH);
                        oversized = true;
                    }
                    continue;
                }
                if oversized {
                    oversized = false;
                    continue;
                }
                let text = String::from_utf8_lossy(&line);
                let Some(notification) = parse_notification(&text) else {
                    continue;
                };
                if let Err(err) = dispatch(notification, &writer, &auth, &events).await {
                    break SessionEvent::Failed(err);
                }
            }
            Err(e) => break SessionEvent::Disconnected(e.to_string()),
        }
    };

    open.store(false, Ordering::SeqCst);
    writer.lock().await.take();

    match &outcome {
        SessionEvent::Failed(err) => error!("Management session failed: {}", err),
        SessionEvent::Disconnected(reason) => info!("Management session closed: {}", reason),
        _ => {}
    }
    let _ = events.send(outcome);
}

async fn dispatch(
    notification: Notification,
    writer: &SharedWriter,
    auth: &AuthCredential,
    events: &mpsc::UnboundedSender<SessionEvent>,
) -> Result<(), ProtocolError> {
    match notification {
        Notification::ByteCount { received, sent } => {
            let _ = events.send(SessionEvent::Bandwidth {
                bytes_received: received,
                bytes_sent: sent,
            });
        }
        Notification::Hold => {
            debug!("Daemon is holding, releasing");
            write_line(writer, ManagementCommands::HOLD_RELEASE).await?;
        }
        Notification::Password(challenge) => {
            answer_challenge(&challenge, auth, writer).await?;
        }
        Notification::State(report) => {
            debug!("Daemon state: {} ({})", report.phase, report.detail);
            let _ = events.send(SessionEvent::State(report));
        }
    }
    Ok(())
}

async fn answer_challenge(
    challenge: &str,
    auth: &AuthCredential,
    writer: &SharedWriter,
) -> Result<(), ProtocolError> {
    let mismatch = |required| ProtocolError::AuthMismatch {
        challenge: challenge.to_string(),
        required,
        held: auth.kind(),
    };

    match challenge {
        PRIVATE_KEY_CHALLENGE => match auth {
            AuthCredential::Token { value } => {
                write_line(writer, &ManagementCommands::password("Private Key", value)).await
            }
            _ => Err(mismatch(CredentialKind::Token)),
        },
        AUTH_CHALLENGE => match auth {
            AuthCredential::UserPass { username, password } => {
                write_line(writer, &ManagementCommands::username("Auth", username)).await?;
                write_line(writer, &ManagementCommands::password("Auth", password)).await
            }
            _ => Err(mismatch(CredentialKind::UserPass)),
        },
        other => {
            warn!("Unhandled password notification: {}", other);
            Ok(())
        }
    }
}

/// Owner of the single management session.
///
/// A new session may only be opened once the previous one is closed.
pub struct ProtocolClient {
    session: Mutex<Option<ManagementSession>>,
    connect_timeout: Duration,
}

impl ProtocolClient {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            session: Mutex::new(None),
            connect_timeout,
        }
    }

    /// Connect to the management port on the loopback interface
    pub async fn connect(
        &self,
        port: u16,
        auth: AuthCredential,
    ) -> VpnctlResult<mpsc::UnboundedReceiver<SessionEvent>> {
        let mut slot = self.session.lock().await;
        Self::ensure_closed(&mut slot).await?;

        let stream = match tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((MANAGEMENT_HOST, port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ProtocolError::ConnectFailed {
                    port,
                    reason: e.to_string(),
                }
                .into())
            }
            Err(_) => {
                return Err(ProtocolError::ConnectFailed {
                    port,
                    reason: format!("timed out after {:?}", self.connect_timeout),
                }
                .into())
            }
        };

        info!("Connected to management interface on port {} (auth: {})", port, auth.kind());
        let (session, events) = ManagementSession::attach(stream, auth).await?;
        *slot = Some(session);
        Ok(events)
    }

    /// Attach to a transport that is already connected
    pub async fn attach<S>(
        &self,
        stream: S,
        auth: AuthCredential,
    ) -> VpnctlResult<mpsc::UnboundedReceiver<SessionEvent>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut slot = self.session.lock().await;
        Self::ensure_closed(&mut slot).await?;

        let (session, events) = ManagementSession::attach(stream, auth).await?;
        *slot = Some(session);
        Ok(events)
    }

    async fn ensure_closed(slot: &mut Option<ManagementSession>) -> VpnctlResult<()> {
        if slot.as_ref().is_some_and(|session| session.is_open()) {
            return Err(VpnctlError::InvalidState(
                "management session must be closed before opening a new one".to_string(),
            ));
        }
        if let Some(mut stale) = slot.take() {
            stale.close().await;
        }
        Ok(())
    }

    pub async fn send(&self, command: &str) -> VpnctlResult<()> {
        let slot = self.session.lock().await;
        match slot.as_ref() {
            Some(session) => Ok(session.send(command).await?),
            None => Err(ProtocolError::NotConnected.into()),
        }
    }

    /// Idempotent graceful shutdown
    pub async fn close(&self) {
        let mut slot = self.session.lock().await;
        if let Some(mut session) = slot.take() {
            session.close().await;
            debug!("Management session closed");
        }
    }

    pub async fn is_open(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|session| session.is_open())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_test::io::Builder;

    fn setup_mock() -> Builder {
        let mut builder = Builder::new();
        builder.write(b"state on\r\n").write(b"bytecount 1\r\n");
        builder
    }

    #[test]
    fn test_parse_state() {
        let n = parse_notification(">STATE:1610000000,connected,SUCCESS,10.8.0.2,203.0.113.5");
        assert_eq!(
            n,
            Some(Notification::State(StateReport {
                observed_at: 1610000000,
                phase: Phase::Connected,
                detail: "SUCCESS".to_string(),
                local_address: "10.8.0.2".to_string(),
                remote_address: "203.0.113.5".to_string(),
            }))
        );
    }

    #[test]
    fn test_parse_state_keyword_and_phase_case_insensitive() {
        let n = parse_notification(">state:1,ADD_ROUTES,,10.8.0.2,1.2.3.4,,,\r");
        assert!(matches!(
            n,
            Some(Notification::State(StateReport { phase: Phase::AddRoutes, .. }))
        ));
    }

    #[test]
    fn test_parse_state_drops_malformed() {
        assert_eq!(parse_notification(">STATE:1610000000,connected,SUCCESS,10.8.0.2"), None);
        assert_eq!(parse_notification(">STATE:1610000000,resolve,,,"), None);
        assert_eq!(parse_notification(">STATE:never,connected,SUCCESS,a,b"), None);
    }

    #[test]
    fn test_parse_bytecount() {
        assert_eq!(
            parse_notification(">BYTECOUNT:1024,2048"),
            Some(Notification::ByteCount { received: 1024, sent: 2048 })
        );
        assert_eq!(parse_notification(">BYTECOUNT:1024"), None);
        assert_eq!(parse_notification(">BYTECOUNT:x,2048"), None);
    }

    #[test]
    fn test_parse_ignored_lines() {
        assert_eq!(parse_notification(""), None);
        assert_eq!(parse_notification(">H"), None);
        assert_eq!(parse_notification("SUCCESS: hold release succeeded"), None);
        assert_eq!(parse_notification(">INFO:OpenVPN Management Interface Version 3"), None);
        assert_eq!(parse_notification(">LOG:1610000000,I,Initialization Sequence Completed"), None);
        assert_eq!(parse_notification(">FOOBAR:something"), None);
        assert_eq!(parse_notification(">NOCOLON"), None);
    }

    #[test]
    fn test_parse_hold_and_password() {
        assert_eq!(
            parse_notification(">HOLD:Waiting for hold release:0"),
            Some(Notification::Hold)
        );
        assert_eq!(
            parse_notification(">PASSWORD:Need 'Auth' username/password"),
            Some(Notification::Password(AUTH_CHALLENGE.to_string()))
        );
    }

    #[test]
    fn test_commands_are_json_quoted() {
        assert_eq!(
            ManagementCommands::username("Auth", "42"),
            "username \"Auth\" \"42\""
        );
        assert_eq!(
            ManagementCommands::password("Private Key", "a\"b\\c"),
            "password \"Private Key\" \"a\\\"b\\\\c\""
        );
    }

    #[tokio::test]
    async fn test_state_reassembled_across_reads() {
        let mock = setup_mock()
            .read(b">STATE:1610000000,connec")
            .read(b"ted,SUCCESS,10.8.0.2,203.0.113.5\n")
            .build();

        let (_session, mut events) = ManagementSession::attach(mock, AuthCredential::None)
            .await
            .unwrap();

        match events.recv().await {
            Some(SessionEvent::State(report)) => {
                assert_eq!(report.phase, Phase::Connected);
                assert_eq!(report.local_address, "10.8.0.2");
                assert_eq!(report.remote_address, "203.0.113.5");
            }
            other => panic!("Expected state event, got {:?}", other),
        }
        assert!(matches!(events.recv().await, Some(SessionEvent::Disconnected(_))));
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_bytecount_emits_bandwidth() {
        let mock = setup_mock().read(b">BYTECOUNT:1024,2048\r\n").build();

        let (_session, mut events) = ManagementSession::attach(mock, AuthCredential::None)
            .await
            .unwrap();

        assert_eq!(
            events.recv().await,
            Some(SessionEvent::Bandwidth { bytes_received: 1024, bytes_sent: 2048 })
        );
        assert!(matches!(events.recv().await, Some(SessionEvent::Disconnected(_))));
    }

    #[tokio::test]
    async fn test_hold_is_released() {
        let mock = setup_mock()
            .read(b">INFO:OpenVPN Management Interface Version 3\r\n>HOLD:Waiting for hold release:0\r\n")
            .write(b"hold release\r\n")
            .build();

        let (_session, mut events) = ManagementSession::attach(mock, AuthCredential::None)
            .await
            .unwrap();

        assert!(matches!(events.recv().await, Some(SessionEvent::Disconnected(_))));
    }

    #[tokio::test]
    async fn test_userpass_challenge_sends_username_then_password() {
        let mock = setup_mock()
            .read(b">PASSWORD:Need 'Auth' username/password\r\n")
            .write(b"username \"Auth\" \"alice\"\r\n")
            .write(b"password \"Auth\" \"s3cret\"\r\n")
            .build();

        let auth = AuthCredential::UserPass {
            username: "alice".to_string(),
            password: "s3cret".to_string(),
        };
        let (_session, mut events) = ManagementSession::attach(mock, auth).await.unwrap();

        assert!(matches!(events.recv().await, Some(SessionEvent::Disconnected(_))));
    }

    #[tokio::test]
    async fn test_token_challenge_sends_private_key_password() {
        let mock = setup_mock()
            .read(b">PASSWORD:Need 'Private Key' password\n")
            .write(b"password \"Private Key\" \"ab\\\"c\"\r\n")
            .build();

        let auth = AuthCredential::Token { value: "ab\"c".to_string() };
        let (_session, mut events) = ManagementSession::attach(mock, auth).await.unwrap();

        assert!(matches!(events.recv().await, Some(SessionEvent::Disconnected(_))));
    }

    #[tokio::test]
    async fn test_credential_mismatch_is_fatal() {
        let mock = setup_mock()
            .read(b">PASSWORD:Need 'Auth' username/password\r\n")
            .build();

        let (session, mut events) = ManagementSession::attach(mock, AuthCredential::None)
            .await
            .unwrap();

        assert_eq!(
            events.recv().await,
            Some(SessionEvent::Failed(ProtocolError::AuthMismatch {
                challenge: AUTH_CHALLENGE.to_string(),
                required: CredentialKind::UserPass,
                held: CredentialKind::None,
            }))
        );
        assert_eq!(events.recv().await, None);
        assert!(!session.is_open());
        assert_eq!(session.send("state").await, Err(ProtocolError::NotConnected));
    }

    #[tokio::test]
    async fn test_oversized_line_is_dropped() {
        let long = vec![b'x'; MAX_LINE_LENGTH as usize + 100];
        let mock = setup_mock()
            .read(b">STATE:1610000000,")
            .read(&long)
            .read(b",a,b\r\n>BYTECOUNT:5,6\r\n")
            .build();

        let (_session, mut events) = ManagementSession::attach(mock, AuthCredential::None)
            .await
            .unwrap();

        assert_eq!(
            events.recv().await,
            Some(SessionEvent::Bandwidth { bytes_received: 5, bytes_sent: 6 })
        );
        assert!(matches!(events.recv().await, Some(SessionEvent::Disconnected(_))));
    }

    #[tokio::test]
    async fn test_client_attach_allows_one_session() {
        let client = ProtocolClient::new(Duration::from_secs(2));
        let _events = client
            .attach(setup_mock().write(b"quit\r\n").build(), AuthCredential::None)
            .await
            .unwrap();
        assert!(client.is_open().await);

        let second = client.attach(Builder::new().build(), AuthCredential::None).await;
        assert!(matches!(second, Err(VpnctlError::InvalidState(_))));
        assert!(client.is_open().await);

        client.close().await;
        assert!(!client.is_open().await);

        let mut events = client.attach(setup_mock().build(), AuthCredential::None).await.unwrap();
        assert!(matches!(events.recv().await, Some(SessionEvent::Disconnected(_))));
    }

    #[tokio::test]
    async fn test_client_connects_and_quits() {
        let listener = TcpListener::bind((MANAGEMENT_HOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = String::new();
            socket.read_to_string(&mut received).await.unwrap();
            received
        });

        let client = ProtocolClient::new(Duration::from_secs(2));
        let _events = client.connect(port, AuthCredential::None).await.unwrap();
        assert!(client.is_open().await);
        client.send("status").await.unwrap();

        let second = client.connect(port, AuthCredential::None).await;
        assert!(matches!(second, Err(VpnctlError::InvalidState(_))));

        client.close().await;
        client.close().await;
        assert!(!client.is_open().await);

        let received = server.await.unwrap();
        assert_eq!(received, "state on\r\nbytecount 1\r\nstatus\r\nquit\r\n");
    }

    #[tokio::test]
    async fn test_client_connect_refused() {
        // Grab a free port, then release it so nothing listens there
        let port = {
            let listener = TcpListener::bind((MANAGEMENT_HOST, 0)).await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let client = ProtocolClient::new(Duration::from_secs(2));
        let result = client.connect(port, AuthCredential::None).await;
        assert!(matches!(
            result,
            Err(VpnctlError::Protocol(ProtocolError::ConnectFailed { .. }))
        ));
        assert!(matches!(
            client.send("state").await,
            Err(VpnctlError::Protocol(ProtocolError::NotConnected))
        ));
    }
}

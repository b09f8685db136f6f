//! Draft sink: IMAP4rev1 `APPEND` into the drafts folder.
//!
//! The protocol exchange is small enough (LOGIN, LIST, CREATE, APPEND, LOGOUT)
//! that it is spoken directly over a blocking socket, run on tokio's blocking
//! pool.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tracing::{debug, info, instrument, warn};

use crate::config::ImapSettings;
use crate::deadline;
use crate::delivery::DraftSink;
use crate::delivery::compose::compose;
use crate::error::DeliveryError;
use crate::pipeline::types::{DeliveryMode, DeliveryResult, GeneratedReply};
use crate::retry::RetryPolicy;

/// Anything we can speak IMAP over: plain TCP or rustls.
trait Transport: Read + Write + Send {}
impl<T: Read + Write + Send> Transport for T {}

/// Marks an I/O error caused by the invocation deadline rather than the peer.
#[derive(Debug)]
struct DeadlinePassed;

impl fmt::Display for DeadlinePassed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invocation deadline reached")
    }
}

impl std::error::Error for DeadlinePassed {}

fn is_deadline(e: &io::Error) -> bool {
    e.get_ref().is_some_and(|inner| inner.is::<DeadlinePassed>())
}

/// TCP socket that never blocks past the invocation deadline.
///
/// Each read or write gets `min(timeout, time left)` and fails once the
/// deadline has passed, so a silent or trickling server cannot hold the
/// blocking thread.
struct DeadlineSocket {
    tcp: TcpStream,
    timeout: Duration,
    deadline: Option<Instant>,
}

impl DeadlineSocket {
    fn budget(&self) -> io::Result<Duration> {
        let limit = deadline::cap(self.timeout, self.deadline);
        if limit.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, DeadlinePassed));
        }
        Ok(limit)
    }

    /// A timeout shortened by the deadline is the deadline's doing.
    fn expired(&self, limit: Duration, e: io::Error) -> io::Error {
        let timed_out = matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut);
        if timed_out && limit < self.timeout {
            return io::Error::new(io::ErrorKind::TimedOut, DeadlinePassed);
        }
        e
    }
}

impl Read for DeadlineSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let limit = self.budget()?;
        self.tcp.set_read_timeout(Some(limit))?;
        self.tcp.read(buf).map_err(|e| self.expired(limit, e))
    }
}

impl Write for DeadlineSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let limit = self.budget()?;
        self.tcp.set_write_timeout(Some(limit))?;
        self.tcp.write(buf).map_err(|e| self.expired(limit, e))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.tcp.flush()
    }
}

fn io_error(context: &str, e: std::io::Error) -> DeliveryError {
    DeliveryError::Imap {
        reason: format!("{context}: {e}"),
        transient: true,
    }
}

fn deadline_reached() -> DeliveryError {
    DeliveryError::DeadlineReached { sink: "imap" }
}

fn rejected(reason: String) -> DeliveryError {
    DeliveryError::Imap {
        reason,
        transient: false,
    }
}

/// Completion status of a tagged command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    No,
    Bad,
}

#[derive(Debug)]
struct Response {
    status: Status,
    /// Text after the status word on the tagged line.
    text: String,
    /// Untagged (`* ...`) lines received before completion.
    untagged: Vec<String>,
}

/// One authenticated-or-not IMAP connection. Dropping it sends `LOGOUT`.
struct ImapSession {
    stream: BufReader<Box<dyn Transport>>,
    next_tag: u32,
    closed: bool,
}

impl ImapSession {
    fn connect(settings: &ImapSettings, deadline: Option<Instant>) -> Result<Self, DeliveryError> {
        let timeout = Duration::from_secs(settings.timeout_secs.max(1));
        let addrs = (settings.host.as_str(), settings.port)
            .to_socket_addrs()
            .map_err(|e| io_error("resolve", e))?;

        let mut last_error = None;
        let mut tcp = None;
        for addr in addrs {
            let limit = deadline::cap(timeout, deadline);
            if limit.is_zero() {
                return Err(deadline_reached());
            }
            match TcpStream::connect_timeout(&addr, limit) {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut && limit < timeout => {
                    return Err(deadline_reached());
                }
                Err(e) => last_error = Some(e),
            }
        }
        let tcp = match (tcp, last_error) {
            (Some(tcp), _) => tcp,
            (None, Some(e)) => return Err(io_error("connect", e)),
            (None, None) => {
                return Err(rejected(format!("{} did not resolve", settings.host)));
            }
        };
        let tcp = DeadlineSocket {
            tcp,
            timeout,
            deadline,
        };

        let transport: Box<dyn Transport> = if settings.tls {
            Box::new(tls_stream(&settings.host, tcp)?)
        } else {
            Box::new(tcp)
        };

        let mut session = Self {
            stream: BufReader::new(transport),
            next_tag: 1,
            closed: false,
        };

        let greeting = session.read_line()?;
        if greeting.starts_with("* BYE") {
            session.closed = true;
            return Err(DeliveryError::Imap {
                reason: format!("server refused connection: {}", greeting.trim_end()),
                transient: true,
            });
        }
        if !(greeting.starts_with("* OK") || greeting.starts_with("* PREAUTH")) {
            return Err(rejected(format!("unexpected greeting: {}", greeting.trim_end())));
        }
        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, DeliveryError> {
        let mut line = String::new();
        let n = self
            .stream
            .read_line(&mut line)
            .map_err(|e| self.socket_error("read", e))?;
        if n == 0 {
            self.closed = true;
            return Err(DeliveryError::Imap {
                reason: "connection closed by server".to_string(),
                transient: true,
            });
        }
        Ok(line)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), DeliveryError> {
        let stream = self.stream.get_mut();
        let result = stream.write_all(bytes).and_then(|()| stream.flush());
        result.map_err(|e| self.socket_error("write", e))
    }

    fn socket_error(&mut self, context: &str, e: io::Error) -> DeliveryError {
        if is_deadline(&e) {
            // Nothing more may be sent, LOGOUT included.
            self.closed = true;
            return deadline_reached();
        }
        io_error(context, e)
    }

    fn tag(&mut self) -> String {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;
        tag
    }

    /// Read until the tagged completion for `tag`.
    fn read_response(&mut self, tag: &str) -> Result<Response, DeliveryError> {
        let mut untagged = Vec::new();
        loop {
            let line = self.read_line()?;
            let Some(rest) = line
                .strip_prefix(tag)
                .and_then(|rest| rest.strip_prefix(' '))
            else {
                untagged.push(line.trim_end().to_string());
                continue;
            };
            let (word, text) = rest.trim_end().split_once(' ').unwrap_or((rest.trim_end(), ""));
            let status = match word.to_ascii_uppercase().as_str() {
                "OK" => Status::Ok,
                "NO" => Status::No,
                _ => Status::Bad,
            };
            return Ok(Response {
                status,
                text: text.to_string(),
                untagged,
            });
        }
    }

    fn command(&mut self, command: &str) -> Result<Response, DeliveryError> {
        let tag = self.tag();
        let verb = command.split(' ').next().unwrap_or_default();
        debug!(%tag, verb, "IMAP command");
        self.write(format!("{tag} {command}\r\n").as_bytes())?;
        self.read_response(&tag)
    }

    fn login(&mut self, username: &str, password: &str) -> Result<(), DeliveryError> {
        let response = self.command(&format!("LOGIN {} {}", quote(username), quote(password)))?;
        match response.status {
            Status::Ok => Ok(()),
            _ => Err(rejected(format!("LOGIN failed: {}", response.text))),
        }
    }

    /// Make sure `folder` exists, creating it when allowed.
    fn ensure_folder(&mut self, folder: &str, create: bool) -> Result<(), DeliveryError> {
        let response = self.command(&format!("LIST \"\" {}", quote(folder)))?;
        if response.status != Status::Ok {
            return Err(rejected(format!("LIST failed: {}", response.text)));
        }
        let exists = response
            .untagged
            .iter()
            .any(|line| line.to_ascii_uppercase().starts_with("* LIST"));
        if exists {
            return Ok(());
        }
        if !create {
            return Err(rejected(format!("folder {folder:?} does not exist")));
        }

        info!(folder, "Creating drafts folder");
        let response = self.command(&format!("CREATE {}", quote(folder)))?;
        match response.status {
            Status::Ok => Ok(()),
            // Lost a race with another client; fine as long as it exists now.
            Status::No if response.text.to_ascii_uppercase().contains("ALREADYEXISTS") => Ok(()),
            _ => Err(rejected(format!("CREATE failed: {}", response.text))),
        }
    }

    /// Append `message` as an unread draft.
    fn append(&mut self, folder: &str, message: &[u8]) -> Result<(), DeliveryError> {
        let tag = self.tag();
        self.write(
            format!(
                "{tag} APPEND {} (\\Draft) {{{}}}\r\n",
                quote(folder),
                message.len()
            )
            .as_bytes(),
        )?;

        let ready = self.read_line()?;
        if !ready.starts_with('+') {
            return Err(rejected(format!("APPEND refused: {}", ready.trim_end())));
        }

        self.write(message)?;
        self.write(b"\r\n")?;
        let response = self.read_response(&tag)?;
        match response.status {
            Status::Ok => Ok(()),
            _ => Err(rejected(format!("APPEND failed: {}", response.text))),
        }
    }

    fn logout(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let tag = self.tag();
        if self.write(format!("{tag} LOGOUT\r\n").as_bytes()).is_ok() {
            let _ = self.read_response(&tag);
        }
    }
}

impl Drop for ImapSession {
    fn drop(&mut self) {
        self.logout();
    }
}

fn tls_stream(
    host: &str,
    tcp: DeadlineSocket,
) -> Result<rustls::StreamOwned<rustls::ClientConnection, DeadlineSocket>, DeliveryError> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| rejected(format!("TLS setup failed: {e}")))?
    .with_root_certificates(root_store)
    .with_no_client_auth();
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| rejected(format!("invalid IMAP host {host:?}: {e}")))?;
    let conn = rustls::ClientConnection::new(Arc::new(config), server_name)
        .map_err(|e| rejected(format!("TLS setup failed: {e}")))?;
    Ok(rustls::StreamOwned::new(conn, tcp))
}

/// IMAP quoted string.
fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// One full connect → append → logout cycle, abandoned at `deadline`.
fn save_draft_blocking(
    settings: &ImapSettings,
    message: &[u8],
    deadline: Option<Instant>,
) -> Result<(), DeliveryError> {
    let mut session = ImapSession::connect(settings, deadline)?;
    let password = settings
        .password
        .as_ref()
        .map(|p| p.expose_secret().to_string())
        .unwrap_or_default();
    session.login(&settings.username, &password)?;
    session.ensure_folder(&settings.drafts_folder, settings.create_folder)?;
    session.append(&settings.drafts_folder, message)?;
    session.logout();
    Ok(())
}

/// Saves replies into the configured drafts folder for review.
pub struct ImapDraftSink {
    settings: Arc<ImapSettings>,
    retry: RetryPolicy,
}

impl ImapDraftSink {
    pub fn new(settings: ImapSettings, retry: RetryPolicy) -> Self {
        Self {
            settings: Arc::new(settings),
            retry,
        }
    }
}

#[async_trait]
impl DraftSink for ImapDraftSink {
    #[instrument(skip_all, fields(folder = %self.settings.drafts_folder, host = %self.settings.host))]
    async fn save_draft(&self, reply: &GeneratedReply) -> DeliveryResult {
        let target = self.settings.drafts_folder.clone();
        let deadline = deadline::current();
        let message = match compose(reply, true) {
            Ok(message) => Arc::new(message.formatted()),
            Err(e) => return DeliveryResult::failed(DeliveryMode::Draft, target, e),
        };

        let outcome = self
            .retry
            .run("imap", |_| {
                let settings = Arc::clone(&self.settings);
                let message = Arc::clone(&message);
                async move {
                    tokio::task::spawn_blocking(move || {
                        save_draft_blocking(&settings, &message, deadline)
                    })
                        .await
                        .map_err(|e| DeliveryError::Imap {
                            reason: format!("draft task failed: {e}"),
                            transient: true,
                        })?
                }
            })
            .await;

        match outcome {
            Ok(((), attempts)) => {
                info!(attempts, message_id = %reply.message_id, "Draft saved");
                DeliveryResult::delivered(DeliveryMode::Draft, target, &reply.message_id)
            }
            Err(failure) => {
                warn!(error = %failure.error, "Draft not saved");
                DeliveryResult::failed(DeliveryMode::Draft, target, failure.error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::sync::{Mutex, mpsc};
    use std::thread;

    use secrecy::SecretString;

    use super::*;
    use crate::error::Retryable;

    #[derive(Default)]
    struct Mailbox {
        commands: Vec<String>,
        appended: Vec<String>,
    }

    /// Scripted single-threaded IMAP server. Accepts `connections` clients.
    fn fake_imap(
        folder_exists: bool,
        accept_login: bool,
        connections: usize,
    ) -> (u16, Arc<Mutex<Mailbox>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mailbox = Arc::new(Mutex::new(Mailbox::default()));
        let shared = Arc::clone(&mailbox);

        thread::spawn(move || {
            for _ in 0..connections {
                let Ok((stream, _)) = listener.accept() else {
                    return;
                };
                let mut writer = stream.try_clone().unwrap();
                let mut reader = BufReader::new(stream);
                writer.write_all(b"* OK fake IMAP ready\r\n").unwrap();

                let mut line = String::new();
                loop {
                    line.clear();
                    if reader.read_line(&mut line).unwrap_or(0) == 0 {
                        break;
                    }
                    let trimmed = line.trim_end().to_string();
                    shared.lock().unwrap().commands.push(trimmed.clone());
                    let (tag, rest) = trimmed.split_once(' ').unwrap();
                    let verb = rest.split(' ').next().unwrap().to_ascii_uppercase();
                    let reply = match verb.as_str() {
                        "LOGIN" if accept_login => format!("{tag} OK logged in\r\n"),
                        "LOGIN" => format!("{tag} NO [AUTHENTICATIONFAILED] bad credentials\r\n"),
                        "LIST" if folder_exists => {
                            format!("* LIST () \"/\" \"Drafts\"\r\n{tag} OK done\r\n")
                        }
                        "LIST" => format!("{tag} OK done\r\n"),
                        "CREATE" => format!("{tag} OK created\r\n"),
                        "APPEND" => {
                            let size: usize = rest
                                .rsplit_once('{')
                                .and_then(|(_, n)| n.strip_suffix('}'))
                                .and_then(|n| n.parse().ok())
                                .unwrap();
                            writer.write_all(b"+ ready\r\n").unwrap();
                            let mut literal = vec![0_u8; size];
                            reader.read_exact(&mut literal).unwrap();
                            let mut crlf = String::new();
                            reader.read_line(&mut crlf).unwrap();
                            shared
                                .lock()
                                .unwrap()
                                .appended
                                .push(String::from_utf8_lossy(&literal).into_owned());
                            format!("{tag} OK APPEND completed\r\n")
                        }
                        "LOGOUT" => {
                            writer
                                .write_all(format!("* BYE\r\n{tag} OK bye\r\n").as_bytes())
                                .unwrap();
                            break;
                        }
                        _ => format!("{tag} BAD unknown\r\n"),
                    };
                    writer.write_all(reply.as_bytes()).unwrap();
                }
            }
        });

        (port, mailbox)
    }

    /// Accepts connections and never speaks. Reports when each client hangs up.
    fn silent_imap() -> (u16, mpsc::Receiver<Instant>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (hung_up, rx) = mpsc::channel();

        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else {
                    return;
                };
                let hung_up = hung_up.clone();
                thread::spawn(move || {
                    let mut buf = [0_u8; 256];
                    while matches!(stream.read(&mut buf), Ok(n) if n > 0) {}
                    let _ = hung_up.send(Instant::now());
                });
            }
        });

        (port, rx)
    }

    fn settings(port: u16) -> ImapSettings {
        ImapSettings {
            host: "127.0.0.1".into(),
            port,
            tls: false,
            username: "agent".into(),
            password: Some(SecretString::from("s3cret".to_string())),
            drafts_folder: "Drafts".into(),
            create_folder: true,
            timeout_secs: 5,
        }
    }

    fn reply() -> GeneratedReply {
        GeneratedReply {
            from_address: "agent@example.org".into(),
            from_name: None,
            to_address: "alice@example.com".into(),
            subject: "Re: Hello".into(),
            body: "Draft body".into(),
            message_id: "<d1@example.org>".into(),
            in_reply_to: Some("<o1@example.com>".into()),
            references: Some("<o1@example.com>".into()),
            loop_marker: crate::VERSION.into(),
        }
    }

    #[test]
    fn quotes_special_characters() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote("a\"b\\c"), "\"a\\\"b\\\\c\"");
    }

    #[tokio::test]
    async fn appends_unread_draft() {
        let (port, mailbox) = fake_imap(true, true, 1);
        let sink = ImapDraftSink::new(settings(port), RetryPolicy::immediate(1));

        let result = sink.save_draft(&reply()).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.target, "Drafts");

        let mailbox = mailbox.lock().unwrap();
        let append = mailbox
            .commands
            .iter()
            .find(|c| c.contains("APPEND"))
            .unwrap();
        assert!(append.contains("(\\Draft)"));
        assert!(!append.contains("\\Seen"));
        assert!(!mailbox.commands.iter().any(|c| c.contains("CREATE")));
        assert!(mailbox.commands.last().unwrap().ends_with("LOGOUT"));

        let draft = &mailbox.appended[0];
        assert!(draft.contains("X-Mail-Agent-Draft: pending-review"));
        assert!(draft.contains("In-Reply-To: <o1@example.com>"));
    }

    #[tokio::test]
    async fn creates_missing_folder() {
        let (port, mailbox) = fake_imap(false, true, 1);
        let sink = ImapDraftSink::new(settings(port), RetryPolicy::immediate(1));

        assert!(sink.save_draft(&reply()).await.success);
        let mailbox = mailbox.lock().unwrap();
        assert!(
            mailbox
                .commands
                .iter()
                .any(|c| c.ends_with("CREATE \"Drafts\""))
        );
        assert_eq!(mailbox.appended.len(), 1);
    }

    #[tokio::test]
    async fn missing_folder_without_create_is_permanent() {
        let (port, _mailbox) = fake_imap(false, true, 1);
        let mut settings = settings(port);
        settings.create_folder = false;
        let sink = ImapDraftSink::new(settings, RetryPolicy::immediate(3));

        let result = sink.save_draft(&reply()).await;
        assert!(!result.success);
        assert!(!result.error.unwrap().is_transient());
    }

    #[tokio::test]
    async fn login_failure_still_logs_out() {
        let (port, mailbox) = fake_imap(true, false, 1);
        let sink = ImapDraftSink::new(settings(port), RetryPolicy::immediate(3));

        let result = sink.save_draft(&reply()).await;
        assert!(!result.success);
        assert!(!result.error.unwrap().is_transient());

        let mailbox = mailbox.lock().unwrap();
        assert!(mailbox.commands.last().unwrap().ends_with("LOGOUT"));
        assert!(mailbox.appended.is_empty());
    }

    #[tokio::test]
    async fn unreachable_server_is_transient() {
        let sink = ImapDraftSink::new(settings(1), RetryPolicy::immediate(2));
        let result = sink.save_draft(&reply()).await;
        assert!(result.error.unwrap().is_transient());
    }

    #[test]
    fn silent_server_is_abandoned_at_deadline() {
        let (port, hung_up) = silent_imap();
        let started = Instant::now();

        let err = save_draft_blocking(
            &settings(port),
            b"Subject: draft\r\n\r\nbody\r\n",
            Some(started + Duration::from_millis(300)),
        )
        .unwrap_err();

        assert!(matches!(err, DeliveryError::DeadlineReached { sink: "imap" }));
        assert!(started.elapsed() < Duration::from_secs(2));
        let closed_at = hung_up.recv_timeout(Duration::from_secs(3)).unwrap();
        assert!(closed_at.duration_since(started) < Duration::from_secs(3));
    }

    #[test]
    fn passed_deadline_never_connects() {
        let (port, _mailbox) = fake_imap(true, true, 1);
        let past = Instant::now().checked_sub(Duration::from_millis(10));

        let err = save_draft_blocking(&settings(port), b"x", past).unwrap_err();
        assert!(matches!(err, DeliveryError::DeadlineReached { .. }));
    }

    #[tokio::test]
    async fn sink_reads_deadline_from_scope() {
        let (port, hung_up) = silent_imap();
        let sink = ImapDraftSink::new(settings(port), RetryPolicy::immediate(1));
        let started = Instant::now();

        let result = deadline::scope(
            started + Duration::from_millis(300),
            sink.save_draft(&reply()),
        )
        .await;

        assert!(!result.success);
        assert!(matches!(
            result.error,
            Some(DeliveryError::DeadlineReached { .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(hung_up.recv_timeout(Duration::from_secs(3)).is_ok());
    }
}

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use miette::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::parser::{expects_reply, parse_command, strip_brackets, Command};
use crate::{
    Action, HeaderFields, Macros, Milter, MilterError, Modification, Modifier, PROTOCOL_VERSION,
};

/// Largest packet accepted from the MTA, command byte included.
pub const MAX_PACKET_LEN: u32 = 1024 * 1024;

/// Pause after a failed accept, so a persistent error such as EMFILE does
/// not spin the accept loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Body bytes buffered per message unless set with [`MilterServer::body_limit`].
pub const DEFAULT_BODY_LIMIT: usize = 8 * 1024 * 1024;

/// Macro stages scoped to one message rather than the whole connection.
const MESSAGE_MACRO_STAGES: [u8; 7] = [b'M', b'R', b'T', b'L', b'N', b'B', b'E'];

type Factory = dyn Fn() -> Box<dyn Milter> + Send + Sync;

/// A bidirectional byte stream a milter session can run on.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Socket the MTA connects to.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    /// Waits for the next MTA connection and returns it with a printable peer.
    pub async fn accept(&self) -> std::io::Result<(Box<dyn AsyncStream>, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((Box::new(stream), addr.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), "unix".to_string()))
            }
        }
    }
}

impl From<TcpListener> for Listener {
    fn from(listener: TcpListener) -> Self {
        Listener::Tcp(listener)
    }
}

#[cfg(unix)]
impl From<UnixListener> for Listener {
    fn from(listener: UnixListener) -> Self {
        Listener::Unix(listener)
    }
}

/// Replies the filter sends to the MTA (`SMFIR_*` in libmilter).
#[derive(Debug, PartialEq)]
enum Response {
    Action(Action),
    Modification(Modification),
    OptNeg {
        version: u32,
        actions: u32,
        protocol: u32,
    },
}

impl Response {
    fn encode(&self) -> BytesMut {
        let mut payload = BytesMut::new();
        let code = match self {
            Response::Action(action) => action.code(),
            Response::Modification(Modification::AddHeader { name, value }) => {
                put_cstring(&mut payload, name);
                put_cstring(&mut payload, value);
                b'h'
            }
            Response::OptNeg {
                version,
                actions,
                protocol,
            } => {
                payload.put_u32(*version);
                payload.put_u32(*actions);
                payload.put_u32(*protocol);
                b'O'
            }
        };

        let mut frame = BytesMut::with_capacity(5 + payload.len());
        frame.put_u32(payload.len() as u32 + 1);
        frame.put_u8(code);
        frame.extend_from_slice(&payload);
        frame
    }
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Reads one packet. Returns `None` once the MTA has closed the connection.
async fn read_packet<R>(reader: &mut R) -> Result<Option<(u8, BytesMut)>, MilterError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len == 0 || len > MAX_PACKET_LEN {
        return Err(MilterError::InvalidLength(len));
    }

    let mut buf = BytesMut::zeroed(len as usize);
    match reader.read_exact(&mut buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let code = buf[0];
    let payload = buf.split_off(1);
    Ok(Some((code, payload)))
}

async fn accept_failed(e: &std::io::Error) {
    error!(error = %e, "error accepting milter connection");
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

async fn write_response<W>(writer: &mut W, response: &Response) -> Result<(), MilterError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&response.encode()).await?;
    Ok(())
}

/// Connection-scoped state kept by the engine on behalf of one handler.
struct MilterSession {
    milter: Box<dyn Milter>,
    actions: u32,
    macros: HashMap<u8, Macros>,
    headers: HeaderFields,
    body: BytesMut,
}

impl MilterSession {
    fn new(milter: Box<dyn Milter>) -> Self {
        MilterSession {
            milter,
            actions: 0,
            macros: HashMap::new(),
            headers: HeaderFields::new(),
            body: BytesMut::new(),
        }
    }

    fn reset_message(&mut self) {
        self.headers.clear();
        self.body.clear();
        for stage in MESSAGE_MACRO_STAGES {
            self.macros.remove(&stage);
        }
    }

    /// Starts over for a new SMTP connection on the same socket. Negotiated
    /// options carry over.
    fn renew(&mut self, milter: Box<dyn Milter>) {
        let actions = self.actions;
        *self = MilterSession::new(milter);
        self.actions = actions;
    }
}

/// Milter protocol server creating one handler per MTA connection.
#[derive(Clone)]
pub struct MilterServer {
    factory: Arc<Factory>,
    body_limit: usize,
}

impl MilterServer {
    pub fn new<F, M>(factory: F) -> Self
    where
        F: Fn() -> M + Send + Sync + 'static,
        M: Milter + 'static,
    {
        MilterServer {
            factory: Arc::new(move || Box::new(factory()) as Box<dyn Milter>),
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    /// Caps the body bytes handed to [`Milter::body`]. Chunks past the limit
    /// are dropped, so handlers see at most the first `limit` bytes.
    pub fn body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    /// Accepts connections until `shutdown` is cancelled. Every connection is
    /// served by its own task; a failing connection does not stop the server.
    pub async fn serve(&self, listener: Listener, shutdown: CancellationToken) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("milter server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    accept_failed(&e).await;
                    continue;
                }
            };
            debug!(%peer, "accepted milter connection");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_client(stream).await {
                    error!(%peer, "error handling milter session: {:?}", e);
                }
            });
        }
    }

    pub async fn handle_client<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut session = MilterSession::new((self.factory)());

        loop {
            let Some((code, payload)) = read_packet(&mut stream).await? else {
                debug!("MTA closed the milter connection");
                return Ok(());
            };

            let command = match parse_command(code, &payload) {
                Ok(command) => command,
                Err(e @ MilterError::UnknownCommand(_)) => return Err(e.into()),
                Err(e) => {
                    warn!(command = %(code as char), "{}", e);
                    if expects_reply(code) {
                        write_response(&mut stream, &Response::Action(Action::TempFail)).await?;
                    }
                    continue;
                }
            };

            if self.handle_command(&mut session, command, &mut stream).await? {
                return Ok(());
            }
        }
    }

    /// Dispatches one command to the handler. Returns `true` when the MTA
    /// ended the connection.
    fn buffer_body(&self, session: &mut MilterSession, chunk: &[u8]) {
        let room = self.body_limit.saturating_sub(session.body.len());
        session.body.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    async fn handle_command<S>(
        &self,
        session: &mut MilterSession,
        command: Command,
        stream: &mut S,
    ) -> Result<bool>
    where
        S: AsyncWrite + Unpin,
    {
        let action = match command {
            Command::OptNeg {
                version,
                actions,
                protocol,
            } => {
                let wanted = session.milter.actions();
                if actions & wanted != wanted {
                    warn!(
                        offered = actions,
                        wanted, "MTA does not offer every action the filter needs"
                    );
                }
                session.actions = actions & wanted;
                debug!(version, actions, protocol, "option negotiation");

                let reply = Response::OptNeg {
                    version: version.min(PROTOCOL_VERSION),
                    actions: session.actions,
                    protocol: 0,
                };
                write_response(stream, &reply).await?;
                return Ok(false);
            }
            Command::Macro { stage, macros } => {
                session.macros.insert(stage, macros);
                return Ok(false);
            }
            Command::Connect {
                hostname,
                family,
                port,
                address,
            } => {
                let address = family.dial_address(port, &address);
                debug!(%hostname, network = family.network(), %address, "connect");
                let macros = session.macros.entry(b'C').or_default();
                session
                    .milter
                    .connect(&hostname, family.network(), &address, macros)
                    .await
            }
            Command::Helo(name) => {
                debug!(%name, "helo");
                let macros = session.macros.entry(b'H').or_default();
                session.milter.helo(&name, macros).await
            }
            Command::Mail(args) => {
                session.headers.clear();
                session.body.clear();
                let sender = args
                    .first()
                    .map(|arg| strip_brackets(arg))
                    .unwrap_or_default();
                debug!(%sender, "mail from");
                let macros = session.macros.entry(b'M').or_default();
                session.milter.mail_from(sender, macros).await
            }
            Command::Rcpt(args) => {
                let recipient = args
                    .first()
                    .map(|arg| strip_brackets(arg))
                    .unwrap_or_default();
                debug!(%recipient, "rcpt to");
                let macros = session.macros.entry(b'R').or_default();
                session.milter.rcpt_to(recipient, macros).await
            }
            Command::Data => Action::Continue,
            Command::Header { name, value } => {
                session.headers.push(name, value);
                Action::Continue
            }
            Command::EndOfHeaders => session.milter.headers(&session.headers).await,
            Command::Body(chunk) => {
                self.buffer_body(session, &chunk);
                Action::Continue
            }
            Command::EndOfBody(chunk) => {
                self.buffer_body(session, &chunk);
                let mut modifier = Modifier::new(session.actions);
                let action = session.milter.body(&session.body, &mut modifier).await;
                for modification in modifier.into_modifications() {
                    write_response(stream, &Response::Modification(modification)).await?;
                }
                session.reset_message();
                action
            }
            Command::Abort => {
                debug!("abort");
                session.milter.abort().await;
                session.reset_message();
                return Ok(false);
            }
            Command::Quit => return Ok(true),
            Command::QuitNewConnection => {
                debug!("quit, new connection");
                session.renew((self.factory)());
                return Ok(false);
            }
            Command::Unknown(cmd) => {
                debug!(command = %cmd, "unknown SMTP command");
                Action::Continue
            }
        };

        write_response(stream, &Response::Action(action)).await?;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    type Events = Arc<Mutex<Vec<String>>>;

    struct RecordingMilter {
        events: Events,
    }

    impl RecordingMilter {
        fn record(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[async_trait]
    impl Milter for RecordingMilter {
        fn actions(&self) -> u32 {
            actions::ADD_HEADERS
        }

        async fn connect(
            &mut self,
            hostname: &str,
            network: &str,
            address: &str,
            macros: &Macros,
        ) -> Action {
            let j = macros.get("j").map(String::as_str).unwrap_or("-");
            self.record(format!("connect {hostname} {network} {address} j={j}"));
            Action::Continue
        }

        async fn helo(&mut self, name: &str, _macros: &Macros) -> Action {
            self.record(format!("helo {name}"));
            Action::Continue
        }

        async fn mail_from(&mut self, sender: &str, macros: &Macros) -> Action {
            let i = macros.get("i").map(String::as_str).unwrap_or("-");
            self.record(format!("mail {sender} i={i}"));
            Action::Continue
        }

        async fn rcpt_to(&mut self, recipient: &str, _macros: &Macros) -> Action {
            self.record(format!("rcpt {recipient}"));
            Action::Continue
        }

        async fn headers(&mut self, headers: &HeaderFields) -> Action {
            let subject = headers.get("subject").unwrap_or("-");
            self.record(format!("headers {} subject={subject}", headers.len()));
            Action::Continue
        }

        async fn body(&mut self, body: &[u8], modifier: &mut Modifier) -> Action {
            self.record(format!("body {}", String::from_utf8_lossy(body)));
            match modifier.add_header("X-Filtered", "yes") {
                Ok(()) => Action::Accept,
                Err(_) => Action::TempFail,
            }
        }

        async fn abort(&mut self) {
            self.record("abort".to_string());
        }
    }

    fn packet(code: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(payload.len() + 5);
        buf.extend_from_slice(&(payload.len() as u32 + 1).to_be_bytes());
        buf.push(code);
        buf.extend_from_slice(payload);
        buf
    }

    fn optneg(actions: u32) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&6u32.to_be_bytes());
        payload.extend_from_slice(&actions.to_be_bytes());
        payload.extend_from_slice(&0x001f_ffffu32.to_be_bytes());
        packet(b'O', &payload)
    }

    async fn send(client: &mut DuplexStream, code: u8, payload: &[u8]) {
        client.write_all(&packet(code, payload)).await.unwrap();
    }

    async fn reply(client: &mut DuplexStream) -> (u8, Vec<u8>) {
        let len = client.read_u32().await.unwrap();
        let mut buf = vec![0; len as usize];
        client.read_exact(&mut buf).await.unwrap();
        (buf[0], buf[1..].to_vec())
    }

    fn spawn_session(
        events: Events,
        created: Arc<AtomicUsize>,
    ) -> (DuplexStream, JoinHandle<Result<()>>) {
        let server = MilterServer::new(move || {
            created.fetch_add(1, Ordering::SeqCst);
            RecordingMilter {
                events: events.clone(),
            }
        });
        let (client, server_side) = tokio::io::duplex(64 * 1024);
        let handle = tokio::spawn(async move { server.handle_client(server_side).await });
        (client, handle)
    }

    #[test]
    fn test_encode_responses() {
        assert_eq!(
            &Response::Action(Action::Accept).encode()[..],
            &[0, 0, 0, 1, b'a']
        );
        assert_eq!(
            &Response::Modification(Modification::AddHeader {
                name: "Reply-To".to_string(),
                value: "a@b".to_string(),
            })
            .encode()[..],
            b"\x00\x00\x00\x0ehReply-To\x00a@b\x00"
        );
    }

    #[tokio::test]
    async fn test_option_negotiation() {
        let events = Events::default();
        let (mut client, handle) = spawn_session(events, Arc::default());

        client.write_all(&optneg(0x3f)).await.unwrap();
        let (code, payload) = reply(&mut client).await;
        assert_eq!(code, b'O');
        assert_eq!(payload, vec![0, 0, 0, 6, 0, 0, 0, 1, 0, 0, 0, 0]);

        send(&mut client, b'Q', b"").await;
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_full_message_session() {
        let events = Events::default();
        let (mut client, handle) = spawn_session(events.clone(), Arc::default());

        client.write_all(&optneg(0x3f)).await.unwrap();
        assert_eq!(reply(&mut client).await.0, b'O');

        send(&mut client, b'D', b"Cj\x00mx.example.com\x00").await;
        send(
            &mut client,
            b'C',
            b"client.example.com\x004\x00\x19192.0.2.1\x00",
        )
        .await;
        assert_eq!(reply(&mut client).await.0, b'c');

        send(&mut client, b'H', b"client.example.com\x00").await;
        assert_eq!(reply(&mut client).await.0, b'c');

        send(&mut client, b'D', b"Mi\x00ABC123\x00").await;
        send(&mut client, b'M', b"<user@test.lan>\x00SIZE=10\x00").await;
        assert_eq!(reply(&mut client).await.0, b'c');

        send(&mut client, b'R', b"<root@example.com>\x00").await;
        assert_eq!(reply(&mut client).await.0, b'c');

        send(&mut client, b'T', b"").await;
        assert_eq!(reply(&mut client).await.0, b'c');

        send(&mut client, b'L', b"Subject\x00hello\x00").await;
        assert_eq!(reply(&mut client).await.0, b'c');

        send(&mut client, b'N', b"").await;
        assert_eq!(reply(&mut client).await.0, b'c');

        send(&mut client, b'B', b"hi").await;
        assert_eq!(reply(&mut client).await.0, b'c');

        // The modification must reach the MTA before the final verdict
        send(&mut client, b'E', b"").await;
        assert_eq!(
            reply(&mut client).await,
            (b'h', b"X-Filtered\x00yes\x00".to_vec())
        );
        assert_eq!(reply(&mut client).await.0, b'a');

        send(&mut client, b'Q', b"").await;
        assert!(handle.await.unwrap().is_ok());

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                "connect client.example.com tcp4 192.0.2.1:25 j=mx.example.com",
                "helo client.example.com",
                "mail user@test.lan i=ABC123",
                "rcpt root@example.com",
                "headers 1 subject=hello",
                "body hi",
            ]
        );
    }

    #[tokio::test]
    async fn test_modification_without_negotiated_action() {
        let events = Events::default();
        let (mut client, handle) = spawn_session(events, Arc::default());

        client.write_all(&optneg(0)).await.unwrap();
        let (_, payload) = reply(&mut client).await;
        assert_eq!(&payload[4..8], &[0, 0, 0, 0]);

        send(&mut client, b'M', b"<user@test.lan>\x00").await;
        assert_eq!(reply(&mut client).await.0, b'c');
        send(&mut client, b'E', b"body").await;
        assert_eq!(reply(&mut client).await.0, b't');

        drop(client);
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_body_is_capped_at_limit() {
        let events = Events::default();
        let recorded = events.clone();
        let server = MilterServer::new(move || RecordingMilter {
            events: recorded.clone(),
        })
        .body_limit(4);
        let (mut client, server_side) = tokio::io::duplex(64 * 1024);
        let handle = tokio::spawn(async move { server.handle_client(server_side).await });

        client.write_all(&optneg(0x3f)).await.unwrap();
        assert_eq!(reply(&mut client).await.0, b'O');

        send(&mut client, b'M', b"<user@test.lan>\x00").await;
        assert_eq!(reply(&mut client).await.0, b'c');
        send(&mut client, b'B', b"hel").await;
        assert_eq!(reply(&mut client).await.0, b'c');
        send(&mut client, b'B', b"lo ").await;
        assert_eq!(reply(&mut client).await.0, b'c');
        send(&mut client, b'E', b"world").await;
        assert_eq!(reply(&mut client).await.0, b'h');
        assert_eq!(reply(&mut client).await.0, b'a');

        send(&mut client, b'Q', b"").await;
        assert!(handle.await.unwrap().is_ok());
        assert!(events.lock().unwrap().contains(&"body hell".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_failure_backs_off() {
        let start = tokio::time::Instant::now();
        accept_failed(&std::io::Error::from(ErrorKind::Other)).await;
        assert!(start.elapsed() >= ACCEPT_BACKOFF);
    }

    #[tokio::test]
    async fn test_malformed_packet_gets_tempfail() {
        let (mut client, handle) = spawn_session(Events::default(), Arc::default());

        send(&mut client, b'H', b"no terminator").await;
        assert_eq!(reply(&mut client).await.0, b't');

        // Malformed macros have no reply; the session carries on
        send(&mut client, b'D', b"").await;
        send(&mut client, b'H', b"client.example.com\x00").await;
        assert_eq!(reply(&mut client).await.0, b'c');

        send(&mut client, b'Q', b"").await;
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_abort_and_new_connection() {
        let events = Events::default();
        let created = Arc::new(AtomicUsize::new(0));
        let (mut client, handle) = spawn_session(events.clone(), created.clone());

        client.write_all(&optneg(0x3f)).await.unwrap();
        reply(&mut client).await;

        send(&mut client, b'M', b"<user@test.lan>\x00").await;
        reply(&mut client).await;
        send(&mut client, b'B', b"partial").await;
        reply(&mut client).await;
        send(&mut client, b'A', b"").await;

        send(&mut client, b'M', b"<user@test.lan>\x00").await;
        reply(&mut client).await;
        send(&mut client, b'E', b"fresh").await;
        assert_eq!(reply(&mut client).await.0, b'h');
        assert_eq!(reply(&mut client).await.0, b'a');

        send(&mut client, b'K', b"").await;
        send(&mut client, b'H', b"other.example.com\x00").await;
        assert_eq!(reply(&mut client).await.0, b'c');

        send(&mut client, b'Q', b"").await;
        assert!(handle.await.unwrap().is_ok());

        assert_eq!(created.load(Ordering::SeqCst), 2);
        let events = events.lock().unwrap();
        assert!(events.contains(&"abort".to_string()));
        assert!(events.contains(&"body fresh".to_string()));
        assert!(!events.iter().any(|e| e.contains("partial")));
    }

    #[tokio::test]
    async fn test_protocol_errors_end_the_session() {
        let (mut client, handle) = spawn_session(Events::default(), Arc::default());
        send(&mut client, b'z', b"").await;
        assert!(handle.await.unwrap().is_err());

        let (mut client, handle) = spawn_session(Events::default(), Arc::default());
        client.write_all(&[0, 0, 0, 0]).await.unwrap();
        assert!(handle.await.unwrap().is_err());

        // EOF ends the session without a verdict
        let (client, handle) = spawn_session(Events::default(), Arc::default());
        drop(client);
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_serve_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let events = Events::default();
        let server = MilterServer::new(move || RecordingMilter {
            events: events.clone(),
        });
        let shutdown = CancellationToken::new();
        let serve = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server.serve(listener.into(), shutdown).await })
        };

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(&optneg(0x3f)).await.unwrap();
        let len = stream.read_u32().await.unwrap();
        let mut buf = vec![0; len as usize];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[0], b'O');

        shutdown.cancel();
        assert!(serve.await.unwrap().is_ok());
    }
}

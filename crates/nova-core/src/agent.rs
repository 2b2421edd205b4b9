use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::function::{FileMap, Function};
use crate::protocol::{
    self, ExecPayload, InitPayload, Message, ProtocolError, ReloadPayload, RespPayload,
    StreamPayload,
};

/// Slack added on top of the function timeout for one execute round trip.
const EXECUTE_DEADLINE_SLACK: Duration = Duration::from_secs(5);
/// Deadline for a reload (code splice) round trip.
const RELOAD_DEADLINE: Duration = Duration::from_secs(30);
/// Deadline for a health ping.
const PING_DEADLINE: Duration = Duration::from_secs(3);
/// Deadline for the init handshake.
const INIT_DEADLINE: Duration = Duration::from_secs(10);
/// Backoff schedule for broken-connection retries.
const RETRY_BACKOFF_MS: [u64; 3] = [10, 25, 50];
/// Execute attempts before the last error is surfaced.
const EXECUTE_ATTEMPTS: usize = 3;

/// Byte stream the agent protocol runs over.
pub trait AgentIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AgentIo for T {}

/// Dials a fresh connection to the in-sandbox agent.
///
/// The client opens one connection per request, so `dial` must be cheap to
/// call repeatedly. Drivers supply the transport when opening a client
/// (TCP for microVM drivers, in-memory duplex in tests).
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn dial(&self) -> std::io::Result<Box<dyn AgentIo>>;
}

/// TCP transport to an agent endpoint like `10.0.3.2:7008`.
pub struct TcpTransport {
    addr: String,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl AgentTransport for TcpTransport {
    async fn dial(&self) -> std::io::Result<Box<dyn AgentIo>> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Framed client for the in-sandbox agent.
///
/// Dials lazily, replays the cached init payload after every dial, and closes
/// the connection after each request. One TCP handshake per call buys
/// deterministic cleanup over persistent connections.
pub struct AgentClient {
    transport: Arc<dyn AgentTransport>,
    cached_init: Mutex<Option<InitPayload>>,
}

impl AgentClient {
    pub fn new(transport: Arc<dyn AgentTransport>) -> Self {
        Self {
            transport,
            cached_init: Mutex::new(None),
        }
    }

    /// Bind the runtime, handler, and env inside the sandbox.
    ///
    /// The payload is cached so later dials can replay it before their
    /// request, keeping the agent initialized across reconnects.
    pub async fn init(&self, function: &Function) -> Result<(), AgentError> {
        let payload = init_payload(function);
        {
            let mut cached = self.cached_init.lock().await;
            *cached = Some(payload.clone());
        }

        let resp = self
            .round_trip(Message::Init(payload), INIT_DEADLINE, false)
            .await?;
        if let Some(err) = resp.error {
            return Err(AgentError::Agent(format!("init rejected: {}", err)));
        }
        Ok(())
    }

    /// Run one invocation. Retries transparently on broken connections with
    /// a 10/25/50 ms backoff; any other failure aborts immediately.
    pub async fn execute(
        &self,
        request_id: &str,
        input: Value,
        timeout: Duration,
        traceparent: Option<String>,
        tracestate: Option<String>,
    ) -> Result<RespPayload, AgentError> {
        let msg = Message::Exec(ExecPayload {
            request_id: request_id.to_string(),
            input,
            timeout_s: timeout.as_secs(),
            traceparent,
            tracestate,
            stream: false,
        });
        let deadline = timeout + EXECUTE_DEADLINE_SLACK;

        let mut last_err = None;
        for attempt in 0..EXECUTE_ATTEMPTS {
            match self.round_trip(msg.clone(), deadline, true).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_connection_broken() => {
                    warn!(
                        request_id = %request_id,
                        attempt = attempt + 1,
                        error = %e,
                        "agent connection broken, retrying"
                    );
                    last_err = Some(e);
                    if attempt + 1 < EXECUTE_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS[attempt])).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| AgentError::Connection("no attempt ran".to_string())))
    }

    /// Run one streaming invocation. Chunks arrive on the returned channel
    /// until a chunk with `is_last` is delivered or the connection drops.
    pub async fn execute_stream(
        &self,
        request_id: &str,
        input: Value,
        timeout: Duration,
        traceparent: Option<String>,
        tracestate: Option<String>,
    ) -> Result<mpsc::Receiver<Result<StreamPayload, AgentError>>, AgentError> {
        let msg = Message::Exec(ExecPayload {
            request_id: request_id.to_string(),
            input,
            timeout_s: timeout.as_secs(),
            traceparent,
            tracestate,
            stream: true,
        });
        let deadline = timeout + EXECUTE_DEADLINE_SLACK;

        let mut conn = self.connect_and_replay().await?;
        protocol::write_frame(&mut conn, &msg)
            .await
            .map_err(classify_protocol_error)?;

        let (tx, rx) = mpsc::channel(32);
        let request_id = request_id.to_string();
        tokio::spawn(async move {
            let stream_result = tokio::time::timeout(deadline, async {
                loop {
                    match protocol::read_frame(&mut conn).await {
                        Ok(Message::Stream(chunk)) => {
                            let is_last = chunk.is_last;
                            if tx.send(Ok(chunk)).await.is_err() || is_last {
                                return;
                            }
                        }
                        Ok(other) => {
                            let _ = tx
                                .send(Err(AgentError::Unexpected(format!(
                                    "expected Stream frame, got {:?}",
                                    other.msg_type()
                                ))))
                                .await;
                            return;
                        }
                        Err(e) => {
                            let _ = tx.send(Err(classify_protocol_error(e))).await;
                            return;
                        }
                    }
                }
            })
            .await;
            if stream_result.is_err() {
                debug!(request_id = %request_id, "stream deadline exceeded");
                // Receiver may already be gone; deadline errors are best-effort.
            }
        });
        Ok(rx)
    }

    /// Replace the user code inside the sandbox. Used by the template splice
    /// path; also clears sandbox-scratch state on the agent side.
    pub async fn reload(&self, files: FileMap) -> Result<(), AgentError> {
        let resp = self
            .round_trip(Message::Reload(ReloadPayload { files }), RELOAD_DEADLINE, true)
            .await?;
        if let Some(err) = resp.error {
            return Err(AgentError::Agent(format!("reload rejected: {}", err)));
        }
        Ok(())
    }

    /// Health probe with a short deadline.
    pub async fn ping(&self) -> Result<(), AgentError> {
        self.round_trip(Message::Ping, PING_DEADLINE, true).await?;
        Ok(())
    }

    /// Ask the agent to shut down, best effort. The driver stop that follows
    /// does not depend on it succeeding.
    pub async fn send_stop(&self) -> Result<(), AgentError> {
        let mut conn = self.dial().await?;
        protocol::write_frame(&mut conn, &Message::Stop)
            .await
            .map_err(classify_protocol_error)
    }

    /// Drop the cached init payload. With per-request connections there is
    /// nothing else to tear down.
    pub async fn close(&self) {
        let mut cached = self.cached_init.lock().await;
        *cached = None;
    }

    async fn dial(&self) -> Result<Box<dyn AgentIo>, AgentError> {
        self.transport
            .dial()
            .await
            .map_err(|e| AgentError::Connection(format!("dial failed: {}", e)))
    }

    /// Dial and replay the cached init, if any, so the agent is bound before
    /// the actual request goes out.
    async fn connect_and_replay(&self) -> Result<Box<dyn AgentIo>, AgentError> {
        let mut conn = self.dial().await?;
        let cached = { self.cached_init.lock().await.clone() };
        if let Some(init) = cached {
            protocol::write_frame(&mut conn, &Message::Init(init))
                .await
                .map_err(classify_protocol_error)?;
            match protocol::read_frame(&mut conn)
                .await
                .map_err(classify_protocol_error)?
            {
                Message::Resp(resp) => {
                    if let Some(err) = resp.error {
                        return Err(AgentError::Agent(format!("init replay rejected: {}", err)));
                    }
                }
                other => {
                    return Err(AgentError::Unexpected(format!(
                        "expected Resp to init, got {:?}",
                        other.msg_type()
                    )))
                }
            }
        }
        Ok(conn)
    }

    /// One full request cycle: dial, optional init replay, send, await Resp.
    async fn round_trip(
        &self,
        msg: Message,
        deadline: Duration,
        replay_init: bool,
    ) -> Result<RespPayload, AgentError> {
        let fut = async {
            let mut conn = if replay_init {
                self.connect_and_replay().await?
            } else {
                self.dial().await?
            };
            protocol::write_frame(&mut conn, &msg)
                .await
                .map_err(classify_protocol_error)?;
            match protocol::read_frame(&mut conn)
                .await
                .map_err(classify_protocol_error)?
            {
                Message::Resp(resp) => Ok(resp),
                other => Err(AgentError::Unexpected(format!(
                    "expected Resp, got {:?}",
                    other.msg_type()
                ))),
            }
        };
        match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout(format!(
                "agent did not answer within {:?}",
                deadline
            ))),
        }
    }
}

fn init_payload(function: &Function) -> InitPayload {
    InitPayload {
        runtime: function.runtime.to_string(),
        handler: function.handler.clone(),
        env_vars: function.env_vars.clone(),
        command: None,
        extension: None,
        mode: Some(match function.mode {
            crate::function::ExecutionMode::Process => "process".to_string(),
            crate::function::ExecutionMode::Persistent => "persistent".to_string(),
        }),
        function_name: Some(function.name.clone()),
        function_version: Some(function.version),
        memory_mb: Some(function.memory_mb),
        timeout_s: Some(function.timeout_s),
    }
}

fn is_broken_kind(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::ConnectionRefused
    )
}

fn classify_protocol_error(e: ProtocolError) -> AgentError {
    match e {
        ProtocolError::Io(io) if is_broken_kind(io.kind()) => {
            AgentError::Connection(io.to_string())
        }
        other => AgentError::Protocol(other.to_string()),
    }
}

#[derive(Debug)]
pub enum AgentError {
    /// Dial failures and mid-request EOF/reset/broken pipe. Retryable.
    Connection(String),
    /// Framing or message-shape violations. Not retryable.
    Protocol(String),
    /// Round trip exceeded its deadline. Not retryable.
    Timeout(String),
    /// The agent answered with an application-level error.
    Agent(String),
    /// The agent answered with the wrong message kind.
    Unexpected(String),
}

impl AgentError {
    pub fn is_connection_broken(&self) -> bool {
        matches!(self, AgentError::Connection(_))
    }
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentError::Connection(msg) => write!(f, "agent connection error: {}", msg),
            AgentError::Protocol(msg) => write!(f, "agent protocol error: {}", msg),
            AgentError::Timeout(msg) => write!(f, "agent timeout: {}", msg),
            AgentError::Agent(msg) => write!(f, "agent error: {}", msg),
            AgentError::Unexpected(msg) => write!(f, "unexpected agent reply: {}", msg),
        }
    }
}

impl std::error::Error for AgentError {}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::io::DuplexStream;

    /// Behavior knobs for the scripted in-process agent.
    #[derive(Default)]
    pub struct FakeAgentBehavior {
        /// Drop the connection without replying for the first N exec requests.
        pub break_first_execs: AtomicU32,
        /// Reject reload requests with an error payload.
        pub fail_reload: AtomicBool,
        /// Drop the connection on pings instead of answering.
        pub drop_pings: AtomicBool,
    }

    /// Transport that spawns a scripted agent task per dial, speaking the
    /// framed protocol over an in-memory duplex stream.
    pub struct FakeAgentTransport {
        pub behavior: Arc<FakeAgentBehavior>,
        pub dials: Arc<AtomicU32>,
        pub execs: Arc<AtomicU32>,
        pub inits: Arc<AtomicU32>,
        pub reloads: Arc<AtomicU32>,
    }

    impl FakeAgentTransport {
        pub fn new(behavior: FakeAgentBehavior) -> Arc<Self> {
            Arc::new(Self {
                behavior: Arc::new(behavior),
                dials: Arc::new(AtomicU32::new(0)),
                execs: Arc::new(AtomicU32::new(0)),
                inits: Arc::new(AtomicU32::new(0)),
                reloads: Arc::new(AtomicU32::new(0)),
            })
        }

        pub fn well_behaved() -> Arc<Self> {
            Self::new(FakeAgentBehavior::default())
        }
    }

    fn ok_resp(request_id: String, output: Value) -> Message {
        Message::Resp(RespPayload {
            request_id,
            output,
            error: None,
            duration_ms: 1,
            stdout: None,
            stderr: None,
        })
    }

    async fn serve(
        mut conn: DuplexStream,
        behavior: Arc<FakeAgentBehavior>,
        execs: Arc<AtomicU32>,
        inits: Arc<AtomicU32>,
        reloads: Arc<AtomicU32>,
    ) {
        loop {
            let msg = match protocol::read_frame(&mut conn).await {
                Ok(msg) => msg,
                Err(_) => return,
            };
            let reply = match msg {
                Message::Init(_) => {
                    inits.fetch_add(1, Ordering::SeqCst);
                    ok_resp(String::new(), Value::Null)
                }
                Message::Exec(exec) => {
                    execs.fetch_add(1, Ordering::SeqCst);
                    let broke = behavior
                        .break_first_execs
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                        .is_ok();
                    if broke {
                        return; // simulate a dropped connection
                    }
                    if exec.stream {
                        for (i, chunk) in ["a", "b", "c"].iter().enumerate() {
                            let frame = Message::Stream(StreamPayload {
                                request_id: exec.request_id.clone(),
                                data: Value::String(chunk.to_string()),
                                is_last: i == 2,
                                error: None,
                            });
                            if protocol::write_frame(&mut conn, &frame).await.is_err() {
                                return;
                            }
                        }
                        continue;
                    }
                    ok_resp(exec.request_id, exec.input)
                }
                Message::Ping => {
                    if behavior.drop_pings.load(Ordering::SeqCst) {
                        return;
                    }
                    ok_resp(String::new(), Value::Null)
                }
                Message::Reload(_) => {
                    reloads.fetch_add(1, Ordering::SeqCst);
                    if behavior.fail_reload.load(Ordering::SeqCst) {
                        Message::Resp(RespPayload {
                            request_id: String::new(),
                            output: Value::Null,
                            error: Some("reload unsupported".to_string()),
                            duration_ms: 0,
                            stdout: None,
                            stderr: None,
                        })
                    } else {
                        ok_resp(String::new(), Value::Null)
                    }
                }
                Message::Stop => return,
                Message::Resp(_) | Message::Stream(_) => continue,
            };
            if protocol::write_frame(&mut conn, &reply).await.is_err() {
                return;
            }
        }
    }

    #[async_trait]
    impl AgentTransport for FakeAgentTransport {
        async fn dial(&self) -> std::io::Result<Box<dyn AgentIo>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let (client_end, server_end) = tokio::io::duplex(256 * 1024);
            tokio::spawn(serve(
                server_end,
                Arc::clone(&self.behavior),
                Arc::clone(&self.execs),
                Arc::clone(&self.inits),
                Arc::clone(&self.reloads),
            ));
            Ok(Box::new(client_end))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeAgentBehavior, FakeAgentTransport};
    use super::*;
    use crate::function::Function;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn test_function() -> Function {
        crate::function::testing::test_function("fn_agent")
    }

    fn client(transport: &Arc<FakeAgentTransport>) -> AgentClient {
        AgentClient::new(Arc::clone(transport) as Arc<dyn AgentTransport>)
    }

    #[tokio::test]
    async fn execute_round_trips_input() {
        let transport = FakeAgentTransport::well_behaved();
        let client = client(&transport);
        client.init(&test_function()).await.unwrap();

        let resp = client
            .execute(
                "req_1",
                serde_json::json!({"n": 7}),
                Duration::from_secs(5),
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(resp.request_id, "req_1");
        assert_eq!(resp.output, serde_json::json!({"n": 7}));
    }

    #[tokio::test]
    async fn init_is_replayed_after_each_dial() {
        let transport = FakeAgentTransport::well_behaved();
        let client = client(&transport);
        client.init(&test_function()).await.unwrap();
        assert_eq!(transport.inits.load(Ordering::SeqCst), 1);

        client
            .execute("req_1", serde_json::Value::Null, Duration::from_secs(5), None, None)
            .await
            .unwrap();
        client
            .execute("req_2", serde_json::Value::Null, Duration::from_secs(5), None, None)
            .await
            .unwrap();

        // Every request dials fresh and replays the cached init first.
        assert_eq!(transport.inits.load(Ordering::SeqCst), 3);
        assert_eq!(transport.dials.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn execute_retries_broken_connections() {
        let transport = FakeAgentTransport::new(FakeAgentBehavior {
            break_first_execs: AtomicU32::new(2),
            ..Default::default()
        });
        let client = client(&transport);
        client.init(&test_function()).await.unwrap();

        let resp = client
            .execute("req_1", serde_json::Value::Null, Duration::from_secs(5), None, None)
            .await
            .unwrap();
        assert_eq!(resp.request_id, "req_1");
        // Two broken attempts plus the successful third.
        assert_eq!(transport.execs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn execute_gives_up_after_three_attempts() {
        let transport = FakeAgentTransport::new(FakeAgentBehavior {
            break_first_execs: AtomicU32::new(u32::MAX),
            ..Default::default()
        });
        let client = client(&transport);
        client.init(&test_function()).await.unwrap();

        let err = client
            .execute("req_1", serde_json::Value::Null, Duration::from_secs(5), None, None)
            .await
            .unwrap_err();
        assert!(err.is_connection_broken());
        assert_eq!(transport.execs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn execute_stream_delivers_chunks_until_last() {
        let transport = FakeAgentTransport::well_behaved();
        let client = client(&transport);
        client.init(&test_function()).await.unwrap();

        let mut rx = client
            .execute_stream("req_s", serde_json::Value::Null, Duration::from_secs(5), None, None)
            .await
            .unwrap();

        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            let chunk = chunk.unwrap();
            let last = chunk.is_last;
            chunks.push(chunk.data);
            if last {
                break;
            }
        }
        assert_eq!(
            chunks,
            vec![
                serde_json::json!("a"),
                serde_json::json!("b"),
                serde_json::json!("c")
            ]
        );
    }

    #[tokio::test]
    async fn reload_surfaces_agent_rejection() {
        let transport = FakeAgentTransport::new(FakeAgentBehavior {
            fail_reload: AtomicBool::new(true),
            ..Default::default()
        });
        let client = client(&transport);
        let err = client.reload(FileMap::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::Agent(_)));
    }

    #[tokio::test]
    async fn ping_detects_dropped_connection() {
        let transport = FakeAgentTransport::new(FakeAgentBehavior {
            drop_pings: AtomicBool::new(true),
            ..Default::default()
        });
        let client = client(&transport);
        let err = client.ping().await.unwrap_err();
        assert!(err.is_connection_broken());
    }

    #[tokio::test]
    async fn close_clears_cached_init() {
        let transport = FakeAgentTransport::well_behaved();
        let client = client(&transport);
        client.init(&test_function()).await.unwrap();
        client.close().await;

        client.ping().await.unwrap();
        // No replay happened after close.
        assert_eq!(transport.inits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn broken_kind_classification() {
        assert!(is_broken_kind(ErrorKind::UnexpectedEof));
        assert!(is_broken_kind(ErrorKind::ConnectionReset));
        assert!(is_broken_kind(ErrorKind::BrokenPipe));
        assert!(!is_broken_kind(ErrorKind::PermissionDenied));
    }

    #[test]
    fn agent_error_display() {
        let err = AgentError::Timeout("5s".to_string());
        assert_eq!(err.to_string(), "agent timeout: 5s");
        let err = AgentError::Connection("reset".to_string());
        assert!(err.is_connection_broken());
    }
}

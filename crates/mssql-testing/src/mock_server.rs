//! In-process mock TDS server.
//!
//! The server answers PRELOGIN and LOGIN7 itself and hands every later
//! request to a handler that returns the token stream to send back. Every
//! request and login it receives is recorded so tests can assert on what
//! the client put on the wire.
//!
//! TLS is not implemented: the PRELOGIN response advertises
//! `NotSupported` unless configured otherwise, so clients must use an
//! encryption mode that accepts a plain connection.
//!
//! ```rust,ignore
//! use mssql_testing::fixtures::{int, int_column, metadata, row};
//! use mssql_testing::mock_server::{MockTdsServer, Reply};
//!
//! let server = MockTdsServer::builder()
//!     .with_handler(|_request| {
//!         Reply::new()
//!             .result_set(&metadata(vec![int_column("n")]), &[row(vec![int(1)])])
//!             .unwrap()
//!             .done(Some(1))
//!     })
//!     .build()
//!     .await?;
//! // connect a client to server.host():server.port()
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};
use mssql_codec::{CodecError, PacketBuffer};
use tds_protocol::codec::decode_utf16_bytes;
use tds_protocol::{
    ColMetaData, Done, DoneStatus, EncryptionLevel, EnvChange, EnvChangeType, EnvChangeValue,
    FeatureAcks, FeatureId, Login7, LoginAck, PacketType, PreLogin, ProcId, Procedure,
    ProtocolError, RawRow, RpcRequest, ServerMessage, SqlServerVersion, TdsVersion, Token,
    TokenParser, TokenType, decode_sql_batch,
};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast};

/// Mock server failure.
#[derive(Debug, Error)]
pub enum MockServerError {
    /// Socket failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Packet framing failure.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A message could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The client sent a message out of order.
    #[error("expected {expected:?} message, got {actual:?}")]
    UnexpectedMessage {
        /// Message the handshake needed.
        expected: PacketType,
        /// Message that arrived.
        actual: PacketType,
    },
}

/// Result type for mock server operations.
pub type Result<T> = std::result::Result<T, MockServerError>;

/// A request received after login.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// SQL batch.
    Batch {
        /// Statement text.
        sql: String,
        /// Transaction descriptor from ALL_HEADERS.
        descriptor: u64,
    },
    /// Remote procedure call.
    Rpc {
        /// Decoded call.
        request: RpcRequest,
        /// Transaction descriptor from ALL_HEADERS.
        descriptor: u64,
    },
    /// Bulk load data.
    BulkLoad {
        /// COLMETADATA describing the rows.
        metadata: ColMetaData,
        /// Rows in the order sent.
        rows: Vec<RawRow>,
        /// Row count from the trailing DONE.
        row_count: Option<u64>,
    },
    /// Attention signal.
    Attention,
}

impl Request {
    /// Statement text of a batch or an `sp_executesql` call.
    #[must_use]
    pub fn statement(&self) -> Option<String> {
        match self {
            Self::Batch { sql, .. } => Some(sql.clone()),
            Self::Rpc { .. } => self.executesql_text(0),
            _ => None,
        }
    }

    /// Parameter declaration list of an `sp_executesql` call.
    #[must_use]
    pub fn param_declarations(&self) -> Option<String> {
        self.executesql_text(1)
    }

    /// Transaction descriptor the client sent.
    #[must_use]
    pub fn descriptor(&self) -> Option<u64> {
        match self {
            Self::Batch { descriptor, .. } | Self::Rpc { descriptor, .. } => Some(*descriptor),
            _ => None,
        }
    }

    fn executesql_text(&self, index: usize) -> Option<String> {
        let Self::Rpc { request, .. } = self else {
            return None;
        };
        if request.procedure != Procedure::Id(ProcId::ExecuteSql) {
            return None;
        }
        let value = request.params.get(index)?.value.as_deref()?;
        decode_utf16_bytes(value).ok()
    }
}

/// Token stream returned for one request.
#[derive(Debug, Clone, Default)]
pub struct Reply {
    tokens: BytesMut,
}

impl Reply {
    /// An empty token stream.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A final DONE reporting `rows` affected.
    #[must_use]
    pub fn affected(rows: u64) -> Self {
        Self::new().done(Some(rows))
    }

    /// Append COLMETADATA followed by one ROW per entry.
    pub fn result_set(
        mut self,
        metadata: &ColMetaData,
        rows: &[RawRow],
    ) -> std::result::Result<Self, ProtocolError> {
        metadata.encode(&mut self.tokens, false);
        for row in rows {
            row.encode(&mut self.tokens, metadata)?;
        }
        Ok(self)
    }

    /// Append a final DONE.
    #[must_use]
    pub fn done(mut self, rows: Option<u64>) -> Self {
        Done::final_with_count(rows).encode(&mut self.tokens, TokenType::Done);
        self
    }

    /// Append a DONE with the MORE bit, ending one statement of several.
    #[must_use]
    pub fn done_more(mut self, rows: Option<u64>) -> Self {
        let mut done = Done::final_with_count(rows);
        done.status |= DoneStatus::MORE;
        done.encode(&mut self.tokens, TokenType::Done);
        self
    }

    /// Append an ERROR token and a DONE flagged as failed.
    #[must_use]
    pub fn error(mut self, number: i32, class: u8, message: &str) -> Self {
        server_message(number, class, message).encode(&mut self.tokens, TokenType::Error);
        let mut done = Done::final_with_count(None);
        done.status |= DoneStatus::ERROR;
        done.encode(&mut self.tokens, TokenType::Done);
        self
    }

    /// Append an INFO token.
    #[must_use]
    pub fn info(mut self, number: i32, message: &str) -> Self {
        server_message(number, 0, message).encode(&mut self.tokens, TokenType::Info);
        self
    }

    /// Append an ENVCHANGE token.
    #[must_use]
    pub fn env_change(mut self, change: &EnvChange) -> Self {
        change.encode(&mut self.tokens);
        self
    }

    /// Append a BEGIN TRANSACTION change carrying `descriptor`.
    #[must_use]
    pub fn begin_transaction(self, descriptor: u64) -> Self {
        self.env_change(&EnvChange {
            env_type: EnvChangeType::BeginTransaction,
            new_value: EnvChangeValue::Binary(Bytes::copy_from_slice(&descriptor.to_le_bytes())),
            old_value: EnvChangeValue::Binary(Bytes::new()),
        })
    }

    /// Append a COMMIT TRANSACTION change ending `descriptor`.
    #[must_use]
    pub fn commit_transaction(self, descriptor: u64) -> Self {
        self.end_transaction(EnvChangeType::CommitTransaction, descriptor)
    }

    /// Append a ROLLBACK TRANSACTION change ending `descriptor`.
    #[must_use]
    pub fn rollback_transaction(self, descriptor: u64) -> Self {
        self.end_transaction(EnvChangeType::RollbackTransaction, descriptor)
    }

    fn end_transaction(self, env_type: EnvChangeType, descriptor: u64) -> Self {
        self.env_change(&EnvChange {
            env_type,
            new_value: EnvChangeValue::Binary(Bytes::new()),
            old_value: EnvChangeValue::Binary(Bytes::copy_from_slice(&descriptor.to_le_bytes())),
        })
    }

    /// Append a RETURNSTATUS token.
    #[must_use]
    pub fn return_status(mut self, status: i32) -> Self {
        tds_protocol::token::encode_return_status(&mut self.tokens, status);
        self
    }

    /// Append bytes verbatim, e.g. a deliberately malformed token.
    #[must_use]
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.tokens.extend_from_slice(bytes);
        self
    }

    /// The encoded token stream.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.tokens.freeze()
    }
}

fn server_message(number: i32, class: u8, message: &str) -> ServerMessage {
    ServerMessage {
        number,
        state: 1,
        class,
        message: message.to_owned(),
        server: "mock".to_owned(),
        procedure: String::new(),
        line: 1,
    }
}

/// Produces the reply for each request.
pub type Handler = Arc<dyn Fn(&Request) -> Reply + Send + Sync>;

struct ServerConfig {
    server_name: String,
    database: String,
    encryption: EncryptionLevel,
    version: SqlServerVersion,
    tds_version: TdsVersion,
    features: FeatureAcks,
    routing: Option<(String, u16)>,
    login_error: Option<(i32, String)>,
    handler: Handler,
}

#[derive(Default)]
struct Recorded {
    prelogins: Mutex<Vec<PreLogin>>,
    logins: Mutex<Vec<Login7>>,
    requests: Mutex<Vec<Request>>,
}

/// Builder for [`MockTdsServer`].
pub struct MockServerBuilder {
    config: ServerConfig,
}

impl MockServerBuilder {
    /// Defaults: SQL Server 16.0, TDS 7.4, database `master`, no TLS, and a
    /// handler answering every request with an empty DONE.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: ServerConfig {
                server_name: "MockSQLServer".to_owned(),
                database: "master".to_owned(),
                encryption: EncryptionLevel::NotSupported,
                version: SqlServerVersion {
                    major: 16,
                    minor: 0,
                    build: 1000,
                    sub_build: 0,
                },
                tds_version: TdsVersion::V7_4,
                features: FeatureAcks::default(),
                routing: None,
                login_error: None,
                handler: Arc::new(|_| Reply::affected(0)),
            },
        }
    }

    /// Server name reported in LOGINACK.
    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.config.server_name = name.into();
        self
    }

    /// Database reported after login.
    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.config.database = database.into();
        self
    }

    /// Encryption level advertised in PRELOGIN.
    #[must_use]
    pub fn with_encryption(mut self, level: EncryptionLevel) -> Self {
        self.config.encryption = level;
        self
    }

    /// Acknowledge JSON support at `version` in FEATUREEXTACK.
    #[must_use]
    pub fn with_json_support(mut self, version: u8) -> Self {
        self.config
            .features
            .push(FeatureId::JsonSupport, Bytes::copy_from_slice(&[version]));
        self
    }

    /// Acknowledge UTF-8 collation support in FEATUREEXTACK.
    #[must_use]
    pub fn with_utf8_support(mut self) -> Self {
        self.config
            .features
            .push(FeatureId::Utf8Support, Bytes::from_static(&[1]));
        self
    }

    /// Redirect every login to `host:port`.
    #[must_use]
    pub fn with_routing(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.routing = Some((host.into(), port));
        self
    }

    /// Reject every login with server error `number`.
    #[must_use]
    pub fn with_login_error(mut self, number: i32, message: impl Into<String>) -> Self {
        self.config.login_error = Some((number, message.into()));
        self
    }

    /// Reply to requests with `handler`.
    #[must_use]
    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Request) -> Reply + Send + Sync + 'static,
    {
        self.config.handler = Arc::new(handler);
        self
    }

    /// Bind to an ephemeral port on 127.0.0.1 and start accepting.
    pub async fn build(self) -> Result<MockTdsServer> {
        MockTdsServer::start(self.config).await
    }
}

impl Default for MockServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running mock server. Dropping it stops the accept loop.
pub struct MockTdsServer {
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    recorded: Arc<Recorded>,
    connection_count: Arc<AtomicUsize>,
}

impl MockTdsServer {
    /// Start configuring a server.
    #[must_use]
    pub fn builder() -> MockServerBuilder {
        MockServerBuilder::new()
    }

    async fn start(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let config = Arc::new(config);
        let recorded = Arc::new(Recorded::default());
        let connection_count = Arc::new(AtomicUsize::new(0));

        let server = Self {
            addr,
            shutdown_tx,
            recorded: Arc::clone(&recorded),
            connection_count: Arc::clone(&connection_count),
        };

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(%peer, "mock server accepted connection");
                            connection_count.fetch_add(1, Ordering::SeqCst);
                            let config = Arc::clone(&config);
                            let recorded = Arc::clone(&recorded);
                            tokio::spawn(async move {
                                if let Err(e) = serve(stream, &config, &recorded).await {
                                    tracing::debug!(error = %e, "mock connection ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "mock server accept failed");
                            break;
                        }
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Ok(server)
    }

    /// Listening address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Host to put in a client configuration.
    #[must_use]
    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    /// Listening port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Connections accepted so far.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    /// PRELOGIN requests received, in order.
    pub async fn prelogins(&self) -> Vec<PreLogin> {
        self.recorded.prelogins.lock().await.clone()
    }

    /// LOGIN7 requests received, in order.
    pub async fn logins(&self) -> Vec<Login7> {
        self.recorded.logins.lock().await.clone()
    }

    /// Requests received after login, in order.
    pub async fn requests(&self) -> Vec<Request> {
        self.recorded.requests.lock().await.clone()
    }

    /// Stop accepting connections.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for MockTdsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve(stream: TcpStream, config: &ServerConfig, recorded: &Recorded) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut buffer = PacketBuffer::new(stream);

    let prelogin = PreLogin::decode(&expect(&mut buffer, PacketType::PreLogin).await?)?;
    recorded.prelogins.lock().await.push(prelogin);
    let response = PreLogin {
        version: config.version.to_bytes(),
        encryption: config.encryption,
        ..PreLogin::default()
    };
    buffer
        .write_message(PacketType::TabularResult, &response.encode(), false)
        .await?;

    let login = Login7::decode(&expect(&mut buffer, PacketType::Tds7Login).await?)?;
    let packet_size = login.packet_size;
    tracing::debug!(user = %login.username, database = %login.database, "mock login");
    recorded.logins.lock().await.push(login);

    let (reply, accepted) = login_reply(config, packet_size);
    buffer
        .write_message(PacketType::TabularResult, &reply, false)
        .await?;
    if !accepted {
        return Ok(());
    }
    buffer.set_packet_size(packet_size as usize);

    loop {
        let message = match buffer.read_message().await {
            Ok(message) => message,
            Err(e) if e.is_connection_error() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let request = match message.packet_type {
            PacketType::SqlBatch => {
                let (descriptor, sql) = decode_sql_batch(&message.payload)?;
                Request::Batch { sql, descriptor }
            }
            PacketType::Rpc => {
                let (descriptor, request) = RpcRequest::decode(&message.payload)?;
                Request::Rpc {
                    request,
                    descriptor,
                }
            }
            PacketType::BulkLoad => decode_bulk_load(message.payload)?,
            PacketType::Attention => Request::Attention,
            other => {
                tracing::debug!(packet_type = ?other, "mock server ignoring message");
                continue;
            }
        };

        let reply = match &request {
            Request::Attention => attention_ack(),
            other => (config.handler)(other),
        };
        recorded.requests.lock().await.push(request);
        buffer
            .write_message(PacketType::TabularResult, &reply.into_bytes(), false)
            .await?;
    }
}

async fn expect(buffer: &mut PacketBuffer<TcpStream>, expected: PacketType) -> Result<Bytes> {
    let message = buffer.read_message().await?;
    if message.packet_type != expected {
        return Err(MockServerError::UnexpectedMessage {
            expected,
            actual: message.packet_type,
        });
    }
    Ok(message.payload)
}

/// The login response and whether the session continues after it.
fn login_reply(config: &ServerConfig, packet_size: u32) -> (Bytes, bool) {
    if let Some((number, message)) = &config.login_error {
        return (Reply::new().error(*number, 14, message).into_bytes(), false);
    }

    let mut reply = Reply::new();
    LoginAck {
        interface: 1,
        tds_version: config.tds_version,
        prog_name: config.server_name.clone(),
        prog_version: [config.version.major, config.version.minor, 0, 0],
    }
    .encode(&mut reply.tokens);

    if let Some((host, port)) = &config.routing {
        let reply = reply
            .env_change(&EnvChange {
                env_type: EnvChangeType::Routing,
                new_value: EnvChangeValue::Routing {
                    host: host.clone(),
                    port: *port,
                },
                old_value: EnvChangeValue::Binary(Bytes::new()),
            })
            .done(None);
        return (reply.into_bytes(), false);
    }

    let mut reply = reply
        .env_change(&string_change(EnvChangeType::Database, &config.database))
        .env_change(&string_change(EnvChangeType::PacketSize, &packet_size.to_string()));
    config.features.encode(&mut reply.tokens);
    (reply.done(None).into_bytes(), true)
}

fn string_change(env_type: EnvChangeType, value: &str) -> EnvChange {
    EnvChange {
        env_type,
        new_value: EnvChangeValue::String(value.to_owned()),
        old_value: EnvChangeValue::String(String::new()),
    }
}

fn attention_ack() -> Reply {
    let mut done = Done::final_with_count(None);
    done.status |= DoneStatus::ATTN;
    let mut reply = Reply::new();
    done.encode(&mut reply.tokens, TokenType::Done);
    reply
}

/// Split a BulkLoad message into its metadata, rows and trailing row count.
pub fn decode_bulk_load(payload: Bytes) -> std::result::Result<Request, ProtocolError> {
    let mut parser = TokenParser::new(payload);
    let Some(Token::ColMetaData(metadata)) = parser.next_token()? else {
        return Err(ProtocolError::MissingMetadata("bulk load"));
    };
    let mut rows = Vec::new();
    let mut row_count = None;
    while let Some(token) = parser.next_token_with_metadata(Some(&metadata))? {
        match token {
            Token::Row(row) | Token::NbcRow(row) => rows.push(row),
            Token::Done(done) => row_count = done.rows_affected(),
            _ => {}
        }
    }
    Ok(Request::BulkLoad {
        metadata,
        rows,
        row_count,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::fixtures::{int, int_column, metadata, row};
    use tds_protocol::RpcParam;

    #[test]
    fn test_reply_tokens_parse() {
        let meta = metadata(vec![int_column("n")]);
        let reply = Reply::new()
            .result_set(&meta, &[row(vec![int(7)]), row(vec![None])])
            .unwrap()
            .done(Some(2));

        let mut parser = TokenParser::new(reply.into_bytes());
        let Some(Token::ColMetaData(decoded)) = parser.next_token().unwrap() else {
            unreachable!("reply must start with COLMETADATA");
        };
        assert_eq!(decoded.columns.len(), 1);
        let first = parser.next_token_with_metadata(Some(&decoded)).unwrap();
        assert!(matches!(first, Some(Token::Row(ref r)) if r.values[0].as_deref() == Some(&7i32.to_le_bytes()[..])));
        let second = parser.next_token_with_metadata(Some(&decoded)).unwrap();
        assert!(matches!(second, Some(Token::Row(ref r)) if r.values[0].is_none()));
        let done = parser.next_token().unwrap();
        assert!(matches!(done, Some(Token::Done(d)) if d.rows_affected() == Some(2)));
    }

    #[test]
    fn test_error_reply_marks_done() {
        let mut parser = TokenParser::new(Reply::new().error(50000, 16, "boom").into_bytes());
        assert!(matches!(
            parser.next_token().unwrap(),
            Some(Token::Error(ref m)) if m.number == 50000 && m.message == "boom"
        ));
        assert!(matches!(parser.next_token().unwrap(), Some(Token::Done(d)) if d.has_error()));
    }

    #[test]
    fn test_transaction_changes_carry_descriptor() {
        let bytes = Reply::new()
            .begin_transaction(0x1122)
            .commit_transaction(0x1122)
            .into_bytes();
        let mut parser = TokenParser::new(bytes);
        let Some(Token::EnvChange(begin)) = parser.next_token().unwrap() else {
            unreachable!("expected ENVCHANGE");
        };
        assert_eq!(begin.transaction_descriptor(), Some(0x1122));
        let Some(Token::EnvChange(commit)) = parser.next_token().unwrap() else {
            unreachable!("expected ENVCHANGE");
        };
        assert_eq!(commit.transaction_descriptor(), Some(0));
    }

    #[test]
    fn test_request_statement_from_executesql() {
        let request = Request::Rpc {
            request: RpcRequest::execute_sql(
                "SELECT @p1",
                vec![RpcParam::nvarchar("@p1", "x")],
            ),
            descriptor: 0,
        };
        assert_eq!(request.statement().as_deref(), Some("SELECT @p1"));
        assert_eq!(request.param_declarations().as_deref(), Some("@p1 nvarchar(1)"));
        assert_eq!(request.descriptor(), Some(0));
    }

    #[tokio::test]
    async fn test_mock_server_starts() {
        let server = MockTdsServer::builder()
            .with_server_name("TestServer")
            .build()
            .await
            .unwrap();
        assert!(server.port() > 0);
        assert_eq!(server.host(), "127.0.0.1");
        assert_eq!(server.connection_count(), 0);
    }
}

//! SQL Server client with type-state connection management.

use bytes::Bytes;
use mssql_codec::PacketBuffer;
use mssql_types::ToSql;
use tds_protocol::{PacketType, RpcRequest, encode_sql_batch};
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

use crate::bulk::{self, BulkCopy, BulkInsertResult, BulkOptions};
use crate::config::Config;
use crate::encryption::CellDecryptor;
use crate::error::{Error, Result};
use crate::login::{self, Stream};
use crate::params::{self, NamedParam};
use crate::response::read_response;
use crate::result::QueryResult;
use crate::state::{
    ConnectionState, Disconnected, InTransaction, LogFlags, Ready, Session, SessionState,
    StateMarker,
};
use crate::transaction::{self, IsolationLevel};
use crate::transport::{Dialer, TcpDialer};

/// Routing redirects followed before giving up.
const MAX_REDIRECTS: u32 = 2;

/// SQL Server client.
///
/// `S` is the connection state. Operations only exist in the states where
/// they are valid: a [`Client<Ready>`] can begin a transaction, a
/// [`Client<InTransaction>`] must commit or roll back to get a
/// [`Client<Ready>`] back.
///
/// A connection is half-duplex: each call writes a whole request and reads
/// the whole response before returning. Callers that share a client across
/// tasks must serialize access themselves.
pub struct Client<S: ConnectionState> {
    config: Config,
    buffer: PacketBuffer<Stream>,
    session: Session,
    decryptor: CellDecryptor,
    _state: StateMarker<S>,
}

impl Client<Disconnected> {
    /// Connect over TCP and log in.
    ///
    /// Transient failures are retried per [`Config::retry`]; routing
    /// redirects are followed.
    ///
    /// ```rust,ignore
    /// let config = Config::new()
    ///     .host("db.example.com")
    ///     .credentials(Credentials::sql_server("app", "secret"));
    /// let mut client = Client::connect(config).await?;
    /// ```
    pub async fn connect(config: Config) -> Result<Client<Ready>> {
        Self::connect_with(config, &TcpDialer).await
    }

    /// Connect through a custom [`Dialer`].
    pub async fn connect_with(config: Config, dialer: &dyn Dialer) -> Result<Client<Ready>> {
        config.validate()?;
        let mut config = config;
        let mut retries = 0;
        let mut redirects = 0;

        loop {
            match Self::try_connect(&config, dialer).await {
                Ok(client) => return Ok(client),
                Err(Error::Routing { host, port }) if redirects < MAX_REDIRECTS => {
                    redirects += 1;
                    tracing::info!(%host, port, redirects, "following routing redirect");
                    config = config.host(host).port(port);
                }
                Err(err) if err.is_transient() && config.retry.should_retry(retries) => {
                    retries += 1;
                    let backoff = config.retry.backoff_for_attempt(retries);
                    tracing::warn!(
                        attempt = retries,
                        max_retries = config.retry.max_retries,
                        ?backoff,
                        error = %err,
                        "connection attempt failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_connect(config: &Config, dialer: &dyn Dialer) -> Result<Client<Ready>> {
        tracing::debug!(host = %config.host, port = config.port, "dialing");
        let transport = timeout(
            config.timeouts.connect_timeout,
            dialer.dial(&config.host, config.port),
        )
        .await
        .map_err(|_| Error::ConnectTimeout)??;

        let (buffer, session) = timeout(
            config.timeouts.login_timeout,
            login::establish(config, transport),
        )
        .await
        .map_err(|_| Error::LoginTimeout)??;

        tracing::info!(
            host = %config.host,
            port = config.port,
            database = ?session.database(),
            tls = ?session.tls(),
            packet_size = session.packet_size(),
            "connection established"
        );
        Ok(Client {
            decryptor: CellDecryptor::new(config.key_providers.clone()),
            config: config.clone(),
            buffer,
            session,
            _state: StateMarker::new(),
        })
    }
}

impl<S: ConnectionState> Client<S> {
    /// Run a SQL batch without parameters.
    pub async fn batch(&mut self, sql: &str) -> Result<QueryResult> {
        if self.session.logs(LogFlags::SQL) {
            tracing::debug!(sql, "sending SQL batch");
        }
        let payload = encode_sql_batch(sql, self.session.transaction_descriptor);
        self.round_trip(PacketType::SqlBatch, payload).await
    }

    /// Run a statement with positional parameters `@p1..@pN`.
    ///
    /// Without parameters the statement goes as a plain batch; otherwise
    /// through `sp_executesql`.
    ///
    /// ```rust,ignore
    /// let result = client
    ///     .query("SELECT name FROM users WHERE id = @p1", &[&42i32])
    ///     .await?;
    /// let name: String = result.rows()[0].get(0)?;
    /// ```
    pub async fn query(&mut self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<QueryResult> {
        if params.is_empty() {
            return self.batch(sql).await;
        }
        let ctx = self.session.param_context(&self.config);
        let encoded = params::positional(params, &ctx)?;
        if self.session.logs(LogFlags::SQL) {
            tracing::debug!(sql, "sending parameterized statement");
        }
        self.log_params(&encoded);
        self.send_rpc(&RpcRequest::execute_sql(sql, encoded)).await
    }

    /// Run a statement and return the number of rows it affected.
    pub async fn execute(&mut self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        Ok(self.query(sql, params).await?.rows_affected())
    }

    /// Call a stored procedure with named parameters.
    ///
    /// Output parameters come back in [`QueryResult::output_params`].
    pub async fn call(&mut self, procedure: &str, params: &[NamedParam]) -> Result<QueryResult> {
        let ctx = self.session.param_context(&self.config);
        let encoded = params::named(params, &ctx)?;
        self.log_params(&encoded);
        let rpc = encoded
            .into_iter()
            .fold(RpcRequest::named(procedure), RpcRequest::param);
        self.send_rpc(&rpc).await
    }

    /// Bulk-load rows into `table`.
    ///
    /// `columns` selects and orders the target columns; empty means every
    /// column of the table. Each row supplies one value per column.
    pub async fn bulk_insert(
        &mut self,
        table: &str,
        columns: &[&str],
        options: &BulkOptions,
        rows: &[&[&(dyn ToSql + Sync)]],
    ) -> Result<BulkInsertResult> {
        let described = self.batch(&bulk::metadata_query(table)).await?;
        let table_columns = described
            .result_sets()
            .first()
            .ok_or_else(|| Error::Bulk(format!("no column metadata returned for {table}")))?
            .columns();

        let mut copy = BulkCopy::new(table, table_columns, columns, options.clone())?;
        for row in rows {
            copy.add_row(row)?;
        }

        self.batch(&copy.statement()).await?;
        let loaded = self.round_trip(PacketType::BulkLoad, copy.payload()).await?;
        tracing::debug!(table, rows = copy.row_count(), "bulk load complete");
        Ok(BulkInsertResult {
            rows_affected: loaded.rows_affected(),
            rows_sent: copy.row_count(),
        })
    }

    /// Protocol state of this connection.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Connection settings.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether an earlier failure left the connection unusable.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.session.state() == SessionState::Failed
    }

    async fn send_rpc(&mut self, rpc: &RpcRequest) -> Result<QueryResult> {
        let payload = rpc.encode(self.session.transaction_descriptor)?;
        self.round_trip(PacketType::Rpc, payload).await
    }

    fn log_params(&self, params: &[tds_protocol::RpcParam]) {
        if self.session.logs(LogFlags::PARAMS) {
            for param in params {
                tracing::debug!(declaration = %param.declaration(), "parameter");
            }
        }
    }

    /// Send one request message and read its response.
    ///
    /// Errors that leave the stream out of sync, and command timeouts, fail
    /// the session; every later call returns [`Error::Poisoned`].
    async fn round_trip(&mut self, packet_type: PacketType, payload: Bytes) -> Result<QueryResult> {
        match self.session.state() {
            SessionState::Ready => {}
            SessionState::Closed => return Err(Error::ConnectionClosed),
            // An abandoned request leaves the session in Executing.
            _ => return Err(Error::Poisoned),
        }
        self.session.transition(SessionState::Executing);

        let command_timeout = self.config.timeouts.command_timeout;
        let request = exchange(
            &mut self.buffer,
            &mut self.session,
            &self.decryptor,
            packet_type,
            &payload,
        );
        let result = match command_timeout {
            Some(limit) => timeout(limit, request)
                .await
                .unwrap_or(Err(Error::CommandTimeout)),
            None => request.await,
        };

        match &result {
            Err(err) if err.is_fatal() => {
                tracing::warn!(error = %err, "connection failed");
                self.session.transition(SessionState::Failed);
            }
            _ => self.session.transition(SessionState::Ready),
        }
        if let Ok(result) = &result {
            if self.session.logs(LogFlags::ROWS) {
                tracing::debug!(
                    rows_affected = result.rows_affected(),
                    result_sets = result.result_sets().len(),
                    "request complete"
                );
            }
        }
        result
    }

    fn into_state<T: ConnectionState>(self) -> Client<T> {
        Client {
            config: self.config,
            buffer: self.buffer,
            session: self.session,
            decryptor: self.decryptor,
            _state: StateMarker::new(),
        }
    }
}

async fn exchange(
    buffer: &mut PacketBuffer<Stream>,
    session: &mut Session,
    decryptor: &CellDecryptor,
    packet_type: PacketType,
    payload: &[u8],
) -> Result<QueryResult> {
    if session.logs(LogFlags::PACKETS) {
        tracing::debug!(?packet_type, len = payload.len(), "sending request");
    }
    buffer.write_message(packet_type, payload, false).await?;
    read_response(buffer, session, decryptor).await
}

impl Client<Ready> {
    /// Begin a transaction at `level`.
    ///
    /// ```rust,ignore
    /// let mut tx = client.begin_transaction(IsolationLevel::ReadCommitted).await?;
    /// tx.execute("UPDATE accounts SET balance = balance - 10 WHERE id = @p1", &[&1i32]).await?;
    /// let client = tx.commit().await?;
    /// ```
    pub async fn begin_transaction(mut self, level: IsolationLevel) -> Result<Client<InTransaction>> {
        tracing::debug!(isolation = level.name(), "beginning transaction");
        self.batch(&transaction::begin_batch(level)).await?;
        if self.session.transaction_descriptor == 0 {
            tracing::warn!("server did not report a transaction descriptor");
        }
        Ok(self.into_state())
    }

    /// Close the connection.
    pub async fn close(mut self) -> Result<()> {
        tracing::debug!("closing connection");
        self.session.transition(SessionState::Closed);
        self.buffer.into_inner().shutdown().await?;
        Ok(())
    }
}

impl Client<InTransaction> {
    /// Commit and return to auto-commit mode.
    pub async fn commit(mut self) -> Result<Client<Ready>> {
        tracing::debug!(descriptor = self.session.transaction_descriptor, "committing transaction");
        self.batch(transaction::COMMIT).await?;
        Ok(self.into_state())
    }

    /// Roll back and return to auto-commit mode.
    pub async fn rollback(mut self) -> Result<Client<Ready>> {
        tracing::debug!(descriptor = self.session.transaction_descriptor, "rolling back transaction");
        self.batch(transaction::ROLLBACK).await?;
        Ok(self.into_state())
    }

    /// Descriptor the server assigned to this transaction.
    #[must_use]
    pub fn descriptor(&self) -> u64 {
        self.session.transaction_descriptor
    }
}

impl<S: ConnectionState> std::fmt::Debug for Client<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("state", &self.session.state())
            .field("database", &self.session.database())
            .finish_non_exhaustive()
    }
}

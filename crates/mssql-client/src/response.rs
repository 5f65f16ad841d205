//! Reading one response message into a [`QueryResult`].
//!
//! Tokens are applied strictly in the order the server sent them. ROW and
//! NBCROW cells are decoded against the most recent COLMETADATA; encrypted
//! cells go through the [`CellDecryptor`] first. A server ERROR does not stop
//! the loop: the rest of the message is consumed so the connection stays in
//! sync, then the first error is returned.

use std::sync::Arc;

use mssql_codec::PacketBuffer;
use mssql_types::{SqlValue, decode_value};
use tds_protocol::token::{ColumnData, CryptoMetadata};
use tds_protocol::{
    ColMetaData, Done, EnvChange, EnvChangeType, PacketType, ProtocolError, ServerMessage, Token,
    TokenParser, TokenType, TypeInfo,
};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::encryption::CellDecryptor;
use crate::error::{Error, Result};
use crate::result::{OutputParam, QueryResult, ResultSet};
use crate::row::Column;
use crate::state::{LogFlags, Session};

/// Read and apply the next response message.
pub(crate) async fn read_response<T>(
    buffer: &mut PacketBuffer<T>,
    session: &mut Session,
    decryptor: &CellDecryptor,
) -> Result<QueryResult>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let message = buffer.read_message().await?;
    if message.packet_type != PacketType::TabularResult {
        return Err(ProtocolError::InvalidPacketType(message.packet_type as u8).into());
    }
    session.spid = buffer.server_spid();
    if session.logs(LogFlags::PACKETS) {
        tracing::debug!(len = message.payload.len(), spid = session.spid, "response received");
    }

    let parser = TokenParser::new(message.payload)
        .with_column_encryption(session.features.column_encryption());
    let mut response = Response::new(parser);
    response.run(session, decryptor).await?;

    if let Some(size) = response.packet_size {
        buffer.set_packet_size(size);
        session.packet_size = buffer.packet_size();
    }
    match response.first_error {
        Some(err) => Err(err),
        None => Ok(response.result),
    }
}

/// Apply an ENVCHANGE to the session.
///
/// Returns the new packet size when the change carries one; the caller owns
/// the packet buffer and must adopt it.
pub(crate) fn apply_env_change(session: &mut Session, env: &EnvChange) -> Option<usize> {
    if let Some(db) = env.new_database() {
        tracing::debug!(database = db, "database changed");
        session.database = Some(db.to_owned());
    }
    if let Some(collation) = env.collation() {
        session.collation = Some(collation);
    }
    if let Some(descriptor) = env.transaction_descriptor() {
        if session.logs(LogFlags::TRANSACTION) {
            tracing::debug!(env_type = ?env.env_type, descriptor, "transaction descriptor changed");
        }
        session.transaction_descriptor = match env.env_type {
            EnvChangeType::CommitTransaction | EnvChangeType::RollbackTransaction => 0,
            _ => descriptor,
        };
    }
    env.packet_size()
}

/// Log a server message according to the session's flags.
pub(crate) fn log_server_message(session: &Session, msg: &ServerMessage) {
    if msg.is_error() {
        if session.logs(LogFlags::ERRORS) {
            tracing::debug!(
                number = msg.number,
                state = msg.state,
                class = msg.class,
                procedure = %msg.procedure,
                line = msg.line,
                "server error: {}",
                msg.message
            );
        }
    } else if session.logs(LogFlags::MESSAGES) {
        tracing::debug!(number = msg.number, "server message: {}", msg.message);
    }
}

struct Response {
    parser: TokenParser,
    metadata: Option<ColMetaData>,
    result: QueryResult,
    first_error: Option<Error>,
    packet_size: Option<usize>,
}

impl Response {
    fn new(parser: TokenParser) -> Self {
        Self {
            parser,
            metadata: None,
            result: QueryResult::default(),
            first_error: None,
            packet_size: None,
        }
    }

    async fn run(&mut self, session: &mut Session, decryptor: &CellDecryptor) -> Result<()> {
        while let Some(token) = self.parser.next_token_with_metadata(self.metadata.as_ref())? {
            match token {
                Token::ColMetaData(meta) => self.start_result_set(meta),
                Token::Row(raw) | Token::NbcRow(raw) => {
                    let meta = self
                        .metadata
                        .as_ref()
                        .ok_or(ProtocolError::MissingMetadata("ROW"))?;
                    let mut values = Vec::with_capacity(raw.values.len());
                    for (column, cell) in meta.columns.iter().zip(&raw.values) {
                        values.push(decode_cell(meta, column, cell.as_deref(), decryptor).await?);
                    }
                    if let Some(set) = self.result.result_sets.last_mut() {
                        set.push(values);
                    }
                }
                Token::Done(done) | Token::DoneProc(done) | Token::DoneInProc(done) => {
                    self.done(session, &done);
                }
                Token::ReturnStatus(status) => self.result.return_status = Some(status),
                Token::ReturnValue(rv) => {
                    let value = match &rv.crypto {
                        Some(crypto) => {
                            let cek_table = self
                                .metadata
                                .as_ref()
                                .map_or(&[][..], |m| m.cek_table.as_slice());
                            decryptor.decrypt(cek_table, crypto, rv.value.as_deref()).await?
                        }
                        None => decode_plain(&rv.type_info, rv.value.as_deref())?,
                    };
                    self.result.output_params.push(OutputParam {
                        name: rv.param_name,
                        ordinal: rv.param_ordinal,
                        value,
                    });
                }
                Token::Error(msg) => {
                    log_server_message(session, &msg);
                    if self.first_error.is_none() {
                        self.first_error = Some(Error::from(&msg));
                    }
                }
                Token::Info(msg) => {
                    log_server_message(session, &msg);
                    self.result.messages.push(msg);
                }
                Token::EnvChange(env) => {
                    if let Some(size) = apply_env_change(session, &env) {
                        self.packet_size = Some(size);
                    }
                }
                Token::Order(columns) => {
                    if session.logs(LogFlags::DEBUG) {
                        tracing::debug!(?columns, "ORDER");
                    }
                }
                Token::SessionState(_) => {}
                Token::LoginAck(_) => return Err(unexpected(TokenType::LoginAck)),
                Token::FeatureExtAck(_) => return Err(unexpected(TokenType::FeatureExtAck)),
                Token::Sspi(_) => return Err(unexpected(TokenType::Sspi)),
                Token::FedAuthInfo(_) => return Err(unexpected(TokenType::FedAuthInfo)),
            }
        }
        Ok(())
    }

    fn start_result_set(&mut self, meta: ColMetaData) {
        if meta.columns.is_empty() {
            self.metadata = None;
            return;
        }
        let columns: Arc<[Column]> = meta
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| Column::from_metadata(i, c))
            .collect();
        self.result.result_sets.push(ResultSet::new(columns));
        self.metadata = Some(meta);
    }

    fn done(&mut self, session: &Session, done: &Done) {
        if let Some(count) = done.rows_affected() {
            self.result.rows_affected += count;
            if session.logs(LogFlags::ROWS) {
                tracing::debug!(rows = count, "rows affected");
            }
        }
        if done.has_error() && self.first_error.is_none() && session.logs(LogFlags::ERRORS) {
            tracing::debug!(status = ?done.status, "DONE reported an error without an ERROR token");
        }
    }
}

/// Login-phase tokens never belong in a query response.
fn unexpected(token: TokenType) -> Error {
    ProtocolError::InvalidTokenType(token as u8).into()
}

async fn decode_cell(
    meta: &ColMetaData,
    column: &ColumnData,
    cell: Option<&[u8]>,
    decryptor: &CellDecryptor,
) -> Result<SqlValue> {
    match &column.crypto {
        Some(crypto) => decrypt_cell(meta, crypto, cell, decryptor).await,
        None => decode_plain(&column.type_info, cell),
    }
}

async fn decrypt_cell(
    meta: &ColMetaData,
    crypto: &CryptoMetadata,
    cell: Option<&[u8]>,
    decryptor: &CellDecryptor,
) -> Result<SqlValue> {
    decryptor.decrypt(&meta.cek_table, crypto, cell).await
}

/// Decode a plaintext cell, keeping the column type on NULL.
fn decode_plain(info: &TypeInfo, cell: Option<&[u8]>) -> Result<SqlValue> {
    match cell {
        None => Ok(SqlValue::TypedNull(info.decl_type_id)),
        Some(data) => Ok(decode_value(info, Some(data))?),
    }
}

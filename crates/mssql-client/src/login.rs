//! Connection establishment.
//!
//! ```text
//! [strict TLS] -> PRELOGIN -> [in-band TLS] -> LOGIN7
//!     -> (SSPI | FEDAUTHINFO round)* -> LOGINACK
//! ```
//!
//! The authentication strategy chosen for the login is released exactly
//! once, whichever way the exchange ends.

use bytes::{BufMut, Bytes, BytesMut};
use mssql_auth::{
    AuthStrategy, AuthTarget, ChannelBinding, Credentials, FederatedTokenStrategy, federated,
};
use mssql_codec::PacketBuffer;
use mssql_tls::{PreloginStream, TlsConnector};
use tds_protocol::{
    EncryptionLevel, FedAuthInfo, FedAuthLibrary, FeatureExtension, Login7, PacketType, PreLogin,
    ProtocolError, TdsVersion, Token, TokenParser, TraceId,
};

use crate::config::{Config, EncryptionMode};
use crate::error::{Error, Result};
use crate::response::{apply_env_change, log_server_message};
use crate::state::{LogFlags, NegotiatedFeatures, Session, SessionState, TlsLifetime};
use crate::transport::{BoxedTransport, MaybeTlsStream};

/// The stream every logged-in connection runs on.
pub(crate) type Stream = MaybeTlsStream<BoxedTransport>;

/// Run the whole handshake over a freshly dialed transport.
pub(crate) async fn establish(
    config: &Config,
    transport: BoxedTransport,
) -> Result<(PacketBuffer<Stream>, Session)> {
    let mut session = Session::new(config);
    let mut buffer = if config.encryption.is_strict() {
        session.transition(SessionState::TlsHandshake);
        let connector = TlsConnector::new(config.tls_config())?;
        let tls = connector.connect(transport, &config.host).await?;
        session.tls = TlsLifetime::Strict;
        PacketBuffer::new(MaybeTlsStream::Tls(Box::new(tls)))
    } else {
        PacketBuffer::new(MaybeTlsStream::Plain(transport))
    };

    session.transition(SessionState::PreLogin);
    let server = exchange_prelogin(&mut buffer, config, &session).await?;

    if !config.encryption.is_strict() {
        session.tls = negotiate_tls(config.encryption, server.encryption)?;
        if session.tls == TlsLifetime::None {
            tracing::warn!(host = %config.host, "connection is not encrypted");
        } else {
            session.transition(SessionState::TlsHandshake);
            buffer = start_inband_tls(buffer, config).await?;
        }
    }

    let mut strategy = ActiveStrategy::default();
    let login = build_login7(config, &server, buffer.get_ref(), &mut strategy)?;
    session.transition(SessionState::LoggingIn);
    buffer
        .write_message(PacketType::Tds7Login, &login.encode(), false)
        .await?;
    if session.tls == TlsLifetime::LoginOnly {
        tracing::debug!("LOGIN7 sent, dropping in-band TLS");
        let raw = buffer.into_inner().into_plain();
        buffer = PacketBuffer::new(raw);
    }

    read_login_response(&mut buffer, config, &server, &mut session, &mut strategy).await?;
    drop(strategy);

    session.transition(SessionState::Ready);
    Ok((buffer, session))
}

/// Decide how long TLS wraps the connection from the two PRELOGIN
/// encryption options.
///
/// | client | server | result |
/// |--------|--------|--------|
/// | `NotSupported` | `Required` | error |
/// | `NotSupported` | other | none |
/// | `Off` | `Off` | login packet only |
/// | `Off` | `NotSupported` | none |
/// | `Off` | `On` / `Required` | whole connection |
/// | `On` / `Required` | `NotSupported` | error |
/// | `On` / `Required` | other | whole connection |
pub(crate) fn negotiate_tls(client: EncryptionMode, server: EncryptionLevel) -> Result<TlsLifetime> {
    match (client, server) {
        (EncryptionMode::Strict, _) => Ok(TlsLifetime::Strict),
        (EncryptionMode::NotSupported, EncryptionLevel::Required) => Err(Error::Login(
            "server requires encryption but the client does not support it".into(),
        )),
        (EncryptionMode::NotSupported, _) => Ok(TlsLifetime::None),
        (EncryptionMode::Off, EncryptionLevel::Off) => Ok(TlsLifetime::LoginOnly),
        (EncryptionMode::Off, EncryptionLevel::NotSupported) => Ok(TlsLifetime::None),
        (EncryptionMode::Off, _) => Ok(TlsLifetime::Connection),
        (EncryptionMode::On | EncryptionMode::Required, EncryptionLevel::NotSupported) => Err(
            Error::Login("encryption was requested but the server does not support it".into()),
        ),
        (EncryptionMode::On | EncryptionMode::Required, _) => Ok(TlsLifetime::Connection),
    }
}

/// PRELOGIN request for this configuration and session.
pub(crate) fn build_prelogin(config: &Config, session: &Session) -> PreLogin {
    let trace_id = (!config.no_trace_id).then(|| TraceId {
        connection_id: session.connection_id().into_bytes(),
        activity_id: session.activity_id().into_bytes(),
        sequence: 0,
    });
    let mut prelogin = PreLogin::client(config.encryption.prelogin_level())
        .with_trace_id(trace_id)
        .with_fed_auth_required(config.credentials.requires_fedauth_prelogin());
    if let Some(instance) = &config.instance {
        prelogin = prelogin.with_instance(instance.clone());
    }
    prelogin
}

async fn exchange_prelogin(
    buffer: &mut PacketBuffer<Stream>,
    config: &Config,
    session: &Session,
) -> Result<PreLogin> {
    let prelogin = build_prelogin(config, session);
    tracing::debug!(encryption = ?prelogin.encryption, "sending PRELOGIN");
    buffer
        .write_message(PacketType::PreLogin, &prelogin.encode(), false)
        .await?;

    let message = buffer.read_message().await?;
    if message.packet_type != PacketType::TabularResult {
        return Err(ProtocolError::InvalidPacketType(message.packet_type as u8).into());
    }
    let server = PreLogin::decode(&message.payload)?;
    tracing::debug!(
        encryption = ?server.encryption,
        server_version = ?server.server_version().map(|v| v.to_string()),
        fed_auth_required = server.fed_auth_required,
        "PRELOGIN response received"
    );
    Ok(server)
}

/// Layer TLS over the raw transport, with handshake records carried in
/// PRELOGIN packets.
async fn start_inband_tls(
    buffer: PacketBuffer<Stream>,
    config: &Config,
) -> Result<PacketBuffer<Stream>> {
    let MaybeTlsStream::Plain(raw) = buffer.into_inner() else {
        return Err(Error::Login("TLS is already active".into()));
    };
    let connector = TlsConnector::new(config.tls_config())?;
    let mut tls = connector.connect(PreloginStream::new(raw), &config.host).await?;
    tls.get_mut().0.handshake_complete();
    Ok(PacketBuffer::new(MaybeTlsStream::PreloginTls(Box::new(tls))))
}

fn build_login7(
    config: &Config,
    server: &PreLogin,
    stream: &Stream,
    strategy: &mut ActiveStrategy,
) -> Result<Login7> {
    let mut login = Login7::new();
    login.tds_version = if config.encryption.is_strict() {
        TdsVersion::V8_0
    } else {
        TdsVersion::V7_4
    };
    login.packet_size = u32::from(config.packet_size);
    login.hostname = config.workstation.clone();
    login.app_name = config.application_name.clone();
    login.server_name = config.host.clone();
    login.database = config.database.clone().unwrap_or_default();

    if config.column_encryption {
        login = login.with_feature(FeatureExtension::ColumnEncryption { version: 1 });
    }
    if config.utf8 {
        login = login.with_feature(FeatureExtension::Utf8Support);
    }
    if config.json_support {
        login = login.with_feature(FeatureExtension::JsonSupport { version: 1 });
    }

    match &config.credentials {
        Credentials::SqlServer { username, password } => {
            login = login.with_sql_auth(username.to_string(), password.to_string());
        }
        Credentials::Integrated(factory) => {
            let mut target = AuthTarget::new(config.host.clone(), config.port);
            if let Some(spn) = &config.spn {
                target = target.with_spn(spn.clone());
            }
            if let Some(cert) = stream.peer_certificate() {
                target = target.with_channel_binding(ChannelBinding::tls_server_end_point(cert));
            }
            let active = strategy.replace((factory.as_ref())(&target)?);
            tracing::debug!(
                strategy = active.name(),
                spn = %target.service_principal_name(),
                "starting integrated authentication"
            );
            let initial = active.initial_bytes()?;
            login = login.with_integrated_auth(Bytes::from(initial));
        }
        Credentials::AccessToken(token) => {
            login = login.with_feature(FeatureExtension::FedAuth {
                library: FedAuthLibrary::SecurityToken,
                echo: server.fed_auth_required,
                token: Some(Bytes::from(federated::encode_token(token))),
                nonce: server.nonce,
            });
        }
        Credentials::FederatedLibrary { workflow, .. } => {
            login = login.with_feature(FeatureExtension::FedAuth {
                library: FedAuthLibrary::Adal {
                    workflow: *workflow,
                },
                echo: server.fed_auth_required,
                token: None,
                nonce: server.nonce,
            });
        }
    }
    tracing::debug!(
        method = config.credentials.method_name(),
        tds_version = ?login.tds_version,
        features = login.features.len(),
        "sending LOGIN7"
    );
    Ok(login)
}

/// Consume login response messages until LOGINACK, answering SSPI and
/// FEDAUTHINFO challenges along the way.
async fn read_login_response(
    buffer: &mut PacketBuffer<Stream>,
    config: &Config,
    server: &PreLogin,
    session: &mut Session,
    strategy: &mut ActiveStrategy,
) -> Result<()> {
    loop {
        let message = buffer.read_message().await?;
        if message.packet_type != PacketType::TabularResult {
            return Err(ProtocolError::InvalidPacketType(message.packet_type as u8).into());
        }
        session.spid = buffer.server_spid();

        let mut parser = TokenParser::new(message.payload);
        let mut acknowledged = false;
        let mut first_error = None;
        let mut routing = None;
        let mut reply: Option<(PacketType, Bytes)> = None;

        while let Some(token) = parser.next_token()? {
            match token {
                Token::LoginAck(ack) => {
                    tracing::info!(
                        tds_version = ?ack.tds_version,
                        server = %ack.prog_name,
                        version = %ack.server_version(),
                        "login acknowledged"
                    );
                    session.tds_version = Some(ack.tds_version);
                    session.server_version = Some(ack.server_version());
                    session.server_name = Some(ack.prog_name);
                    acknowledged = true;
                }
                Token::FeatureExtAck(acks) => {
                    session.features = NegotiatedFeatures::from(&acks);
                    tracing::debug!(features = ?session.features, "feature extensions acknowledged");
                }
                Token::EnvChange(env) => {
                    if let Some((host, port)) = env.routing_info() {
                        tracing::info!(%host, port, "routing redirect received");
                        routing = Some((host.to_owned(), port));
                    } else if let Some(size) = apply_env_change(session, &env) {
                        buffer.set_packet_size(size);
                        session.packet_size = buffer.packet_size();
                        tracing::debug!(packet_size = session.packet_size, "packet size negotiated");
                    }
                }
                Token::Info(msg) => log_server_message(session, &msg),
                Token::Error(msg) => {
                    log_server_message(session, &msg);
                    first_error.get_or_insert_with(|| Error::from(&msg));
                }
                Token::Sspi(challenge) => {
                    session.transition(SessionState::SspiContinue);
                    let active = strategy.current().ok_or_else(|| {
                        Error::Login("server sent SSPI data without integrated authentication".into())
                    })?;
                    let answer = active.next_bytes(&challenge)?;
                    reply = Some((PacketType::Sspi, Bytes::from(answer)));
                }
                Token::FedAuthInfo(info) => {
                    session.transition(SessionState::SspiContinue);
                    let token = acquire_federated_token(config, &info, strategy).await?;
                    let payload = encode_fedauth_token(&token, server.nonce.as_ref());
                    reply = Some((PacketType::FedAuthToken, payload));
                }
                Token::Done(done) => {
                    if done.has_error() && first_error.is_none() && !acknowledged {
                        first_error = Some(Error::Login("server rejected the login".into()));
                    }
                }
                Token::DoneProc(_) | Token::DoneInProc(_) | Token::SessionState(_) => {}
                other => {
                    if session.logs(LogFlags::DEBUG) {
                        tracing::debug!(token = ?other, "ignoring token during login");
                    }
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        if let Some((host, port)) = routing {
            return Err(Error::Routing { host, port });
        }
        if acknowledged {
            return Ok(());
        }
        match reply {
            Some((packet_type, payload)) => {
                buffer.write_message(packet_type, &payload, false).await?;
            }
            None => {
                return Err(Error::Login(
                    "server ended the login exchange without LOGINACK".into(),
                ));
            }
        }
    }
}

async fn acquire_federated_token(
    config: &Config,
    info: &FedAuthInfo,
    strategy: &mut ActiveStrategy,
) -> Result<Vec<u8>> {
    let Credentials::FederatedLibrary { provider, .. } = &config.credentials else {
        return Err(Error::Login(
            "server sent FEDAUTHINFO without a federated token provider".into(),
        ));
    };
    let acquired = FederatedTokenStrategy::acquire(provider, &info.spn, &info.sts_url).await?;
    let active = strategy.replace(Box::new(acquired));
    Ok(active.initial_bytes()?)
}

/// FEDAUTH token message: total length, token length, token, optional
/// nonce.
pub(crate) fn encode_fedauth_token(token: &[u8], nonce: Option<&[u8; 32]>) -> Bytes {
    let nonce_len = nonce.map_or(0, |n| n.len());
    let mut dst = BytesMut::with_capacity(8 + token.len() + nonce_len);
    dst.put_u32_le((4 + token.len() + nonce_len) as u32);
    dst.put_u32_le(token.len() as u32);
    dst.put_slice(token);
    if let Some(nonce) = nonce {
        dst.put_slice(nonce);
    }
    dst.freeze()
}

/// Owns the strategy of the login in progress and frees it on drop.
#[derive(Default)]
struct ActiveStrategy {
    inner: Option<Box<dyn AuthStrategy>>,
}

impl ActiveStrategy {
    /// Install `next`, freeing any earlier strategy first.
    fn replace(&mut self, next: Box<dyn AuthStrategy>) -> &mut Box<dyn AuthStrategy> {
        if let Some(mut previous) = self.inner.take() {
            previous.free();
        }
        self.inner.insert(next)
    }

    fn current(&mut self) -> Option<&mut Box<dyn AuthStrategy>> {
        self.inner.as_mut()
    }
}

impl Drop for ActiveStrategy {
    fn drop(&mut self) {
        if let Some(mut strategy) = self.inner.take() {
            tracing::trace!(strategy = strategy.name(), "releasing authentication strategy");
            strategy.free();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use mssql_auth::AuthError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_negotiation_table() {
        use EncryptionLevel as S;
        use EncryptionMode as C;

        assert_eq!(negotiate_tls(C::NotSupported, S::NotSupported).unwrap(), TlsLifetime::None);
        assert_eq!(negotiate_tls(C::NotSupported, S::Off).unwrap(), TlsLifetime::None);
        assert!(negotiate_tls(C::NotSupported, S::Required).is_err());
        assert_eq!(negotiate_tls(C::Off, S::Off).unwrap(), TlsLifetime::LoginOnly);
        assert_eq!(negotiate_tls(C::Off, S::On).unwrap(), TlsLifetime::Connection);
        assert_eq!(negotiate_tls(C::Off, S::Required).unwrap(), TlsLifetime::Connection);
        assert_eq!(negotiate_tls(C::Off, S::NotSupported).unwrap(), TlsLifetime::None);
        assert_eq!(negotiate_tls(C::On, S::Off).unwrap(), TlsLifetime::Connection);
        assert!(negotiate_tls(C::Required, S::NotSupported).is_err());
        assert!(negotiate_tls(C::On, S::NotSupported).is_err());
        assert_eq!(negotiate_tls(C::Strict, S::NotSupported).unwrap(), TlsLifetime::Strict);
    }

    #[test]
    fn test_prelogin_trace_id_and_fedauth() {
        let config = Config::new().host("db").instance("SQLEXPRESS");
        let session = Session::new(&config);
        let prelogin = build_prelogin(&config, &session);
        let trace = prelogin.trace_id.unwrap();
        assert_eq!(trace.connection_id, session.connection_id().into_bytes());
        assert_eq!(trace.activity_id, session.activity_id().into_bytes());
        assert_eq!(prelogin.instance.as_deref(), Some("SQLEXPRESS"));
        assert!(!prelogin.fed_auth_required);
        assert_eq!(prelogin.encryption, EncryptionLevel::Off);

        let config = Config::new()
            .host("db")
            .no_trace_id(true)
            .credentials(Credentials::federated(Arc::new(mssql_auth::StaticToken::new("t"))))
            .encryption(EncryptionMode::Required);
        let prelogin = build_prelogin(&config, &Session::new(&config));
        assert!(prelogin.trace_id.is_none());
        assert!(prelogin.fed_auth_required);
        assert_eq!(prelogin.encryption, EncryptionLevel::On);
    }

    #[test]
    fn test_fedauth_token_layout() {
        let token = federated::encode_token("ab");
        let nonce = [9u8; 32];
        let payload = encode_fedauth_token(&token, Some(&nonce));
        assert_eq!(&payload[..4], &(4u32 + 4 + 32).to_le_bytes());
        assert_eq!(&payload[4..8], &4u32.to_le_bytes());
        assert_eq!(&payload[8..12], &[b'a', 0, b'b', 0]);
        assert_eq!(&payload[12..], &nonce);

        let bare = encode_fedauth_token(&token, None);
        assert_eq!(&bare[..4], &8u32.to_le_bytes());
        assert_eq!(bare.len(), 12);
    }

    struct Counting {
        freed: Arc<AtomicUsize>,
    }

    impl AuthStrategy for Counting {
        fn name(&self) -> &'static str {
            "Counting"
        }

        fn initial_bytes(&mut self) -> std::result::Result<Vec<u8>, AuthError> {
            Ok(vec![1])
        }

        fn next_bytes(&mut self, server: &[u8]) -> std::result::Result<Vec<u8>, AuthError> {
            Ok(server.to_vec())
        }

        fn free(&mut self) {
            self.freed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_strategy_freed_exactly_once() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        {
            let mut active = ActiveStrategy::default();
            active.replace(Box::new(Counting {
                freed: Arc::clone(&first),
            }));
            active.replace(Box::new(Counting {
                freed: Arc::clone(&second),
            }));
            assert_eq!(first.load(Ordering::SeqCst), 1);
            assert_eq!(second.load(Ordering::SeqCst), 0);
        }
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}

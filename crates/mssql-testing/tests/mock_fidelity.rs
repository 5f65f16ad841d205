//! Wire-level checks of the mock server using a raw packet client.
//!
//! These drive the mock with hand-built PRELOGIN, LOGIN7 and batch
//! messages so the mock's behavior is verified independently of the
//! driver that normally talks to it.

#![allow(clippy::unwrap_used)]

use bytes::Bytes;
use mssql_codec::PacketBuffer;
use mssql_testing::fixtures::{int, int_column, metadata, nvarchar, nvarchar_column, row};
use mssql_testing::{MockTdsServer, Reply, Request};
use tds_protocol::{
    EncryptionLevel, EnvChangeType, EnvChangeValue, Login7, PacketType, PreLogin, Token,
    TokenParser, encode_sql_batch,
};
use tokio::net::TcpStream;

async fn connect(server: &MockTdsServer) -> PacketBuffer<TcpStream> {
    let stream = TcpStream::connect(server.addr()).await.unwrap();
    PacketBuffer::new(stream)
}

async fn prelogin(buffer: &mut PacketBuffer<TcpStream>) -> PreLogin {
    let request = PreLogin::client(EncryptionLevel::NotSupported);
    buffer
        .write_message(PacketType::PreLogin, &request.encode(), false)
        .await
        .unwrap();
    let message = buffer.read_message().await.unwrap();
    assert_eq!(message.packet_type, PacketType::TabularResult);
    PreLogin::decode(&message.payload).unwrap()
}

async fn login(buffer: &mut PacketBuffer<TcpStream>) -> Vec<Token> {
    let mut login = Login7::new().with_sql_auth("sa", "secret");
    login.database = "inventory".into();
    buffer
        .write_message(PacketType::Tds7Login, &login.encode(), false)
        .await
        .unwrap();
    let message = buffer.read_message().await.unwrap();
    tokens(message.payload)
}

fn tokens(payload: Bytes) -> Vec<Token> {
    let mut parser = TokenParser::new(payload);
    let mut tokens = Vec::new();
    while let Some(token) = parser.next_token().unwrap() {
        tokens.push(token);
    }
    tokens
}

#[tokio::test]
async fn test_prelogin_reports_configured_encryption() {
    let server = MockTdsServer::builder()
        .with_encryption(EncryptionLevel::NotSupported)
        .build()
        .await
        .unwrap();

    let mut buffer = connect(&server).await;
    let response = prelogin(&mut buffer).await;

    assert_eq!(response.encryption, EncryptionLevel::NotSupported);
    let version = response.server_version().unwrap();
    assert_eq!(version.major, 16);

    let recorded = server.prelogins().await;
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].encryption, EncryptionLevel::NotSupported);
}

#[tokio::test]
async fn test_login_response_tokens() {
    let server = MockTdsServer::builder()
        .with_server_name("Inventory")
        .with_database("inventory")
        .with_json_support(1)
        .build()
        .await
        .unwrap();

    let mut buffer = connect(&server).await;
    prelogin(&mut buffer).await;
    let tokens = login(&mut buffer).await;

    let Some(Token::LoginAck(ack)) = tokens.first() else {
        unreachable!("first login token must be LOGINACK, got {tokens:?}");
    };
    assert_eq!(ack.prog_name, "Inventory");

    let database = tokens.iter().find_map(|t| match t {
        Token::EnvChange(change) if change.env_type == EnvChangeType::Database => {
            Some(change.new_value.clone())
        }
        _ => None,
    });
    assert_eq!(database, Some(EnvChangeValue::String("inventory".into())));

    let packet_size = tokens.iter().find_map(|t| match t {
        Token::EnvChange(change) if change.env_type == EnvChangeType::PacketSize => {
            Some(change.new_value.clone())
        }
        _ => None,
    });
    assert_eq!(packet_size, Some(EnvChangeValue::String("4096".into())));

    let acks = tokens.iter().find_map(|t| match t {
        Token::FeatureExtAck(acks) => Some(acks.clone()),
        _ => None,
    });
    assert!(acks.unwrap().json_supported());

    assert!(matches!(tokens.last(), Some(Token::Done(_))));

    let logins = server.logins().await;
    assert_eq!(logins.len(), 1);
    assert_eq!(logins[0].username, "sa");
    assert_eq!(logins[0].database, "inventory");
}

#[tokio::test]
async fn test_login_error_reply() {
    let server = MockTdsServer::builder()
        .with_login_error(18456, "Login failed for user 'sa'.")
        .build()
        .await
        .unwrap();

    let mut buffer = connect(&server).await;
    prelogin(&mut buffer).await;
    let tokens = login(&mut buffer).await;

    let Some(Token::Error(error)) = tokens.first() else {
        unreachable!("expected an ERROR token, got {tokens:?}");
    };
    assert_eq!(error.number, 18456);
    assert_eq!(error.class, 14);
    assert!(!tokens.iter().any(|t| matches!(t, Token::LoginAck(_))));
}

#[tokio::test]
async fn test_routing_reply() {
    let server = MockTdsServer::builder()
        .with_routing("replica.internal", 14330)
        .build()
        .await
        .unwrap();

    let mut buffer = connect(&server).await;
    prelogin(&mut buffer).await;
    let tokens = login(&mut buffer).await;

    let route = tokens.iter().find_map(|t| match t {
        Token::EnvChange(change) if change.env_type == EnvChangeType::Routing => {
            Some(change.new_value.clone())
        }
        _ => None,
    });
    assert_eq!(
        route,
        Some(EnvChangeValue::Routing {
            host: "replica.internal".into(),
            port: 14330,
        })
    );
}

#[tokio::test]
async fn test_batch_dispatches_to_handler() {
    let server = MockTdsServer::builder()
        .with_handler(|request: &Request| match request.statement().as_deref() {
            Some("SELECT id, name FROM users") => Reply::new()
                .result_set(
                    &metadata(vec![int_column("id"), nvarchar_column("name", 50)]),
                    &[
                        row(vec![int(1), nvarchar("Alice")]),
                        row(vec![int(2), None]),
                    ],
                )
                .unwrap()
                .done(Some(2)),
            _ => Reply::new().error(208, 16, "Invalid object name."),
        })
        .build()
        .await
        .unwrap();

    let mut buffer = connect(&server).await;
    prelogin(&mut buffer).await;
    login(&mut buffer).await;

    buffer
        .write_message(
            PacketType::SqlBatch,
            &encode_sql_batch("SELECT id, name FROM users", 0),
            false,
        )
        .await
        .unwrap();
    let message = buffer.read_message().await.unwrap();

    let mut parser = TokenParser::new(message.payload);
    let Some(Token::ColMetaData(meta)) = parser.next_token().unwrap() else {
        unreachable!("result set must start with COLMETADATA");
    };
    assert_eq!(meta.columns.len(), 2);
    assert_eq!(meta.columns[1].name, "name");

    let mut rows = Vec::new();
    while let Some(token) = parser.next_token_with_metadata(Some(&meta)).unwrap() {
        if let Token::Row(row) = token {
            rows.push(row);
        }
    }
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].values[1], None);

    buffer
        .write_message(PacketType::SqlBatch, &encode_sql_batch("SELECT nope", 0), false)
        .await
        .unwrap();
    let reply = tokens(buffer.read_message().await.unwrap().payload);
    assert!(matches!(reply.first(), Some(Token::Error(e)) if e.number == 208));

    let requests = server.requests().await;
    assert_eq!(requests.len(), 2);
    assert_eq!(
        requests[0],
        Request::Batch {
            sql: "SELECT id, name FROM users".into(),
            descriptor: 0,
        }
    );
}

#[tokio::test]
async fn test_attention_is_acknowledged() {
    let server = MockTdsServer::builder().build().await.unwrap();

    let mut buffer = connect(&server).await;
    prelogin(&mut buffer).await;
    login(&mut buffer).await;

    buffer
        .write_message(PacketType::Attention, &[], false)
        .await
        .unwrap();
    let reply = tokens(buffer.read_message().await.unwrap().payload);

    let Some(Token::Done(done)) = reply.first() else {
        unreachable!("attention must be answered with DONE");
    };
    assert!(done.status.contains(tds_protocol::DoneStatus::ATTN));
    assert_eq!(server.requests().await, vec![Request::Attention]);
}

#[tokio::test]
async fn test_connection_count() {
    let server = MockTdsServer::builder().build().await.unwrap();
    assert_eq!(server.connection_count(), 0);

    let mut first = connect(&server).await;
    prelogin(&mut first).await;
    let mut second = connect(&server).await;
    prelogin(&mut second).await;

    assert_eq!(server.connection_count(), 2);
}

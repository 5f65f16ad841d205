//! End-to-end client tests against the in-process mock TDS server.
//!
//! These run without SQL Server: the mock answers PRELOGIN and LOGIN7 and
//! hands every later request to the handler each test installs.

#![allow(clippy::unwrap_used)]

use mssql_client::{
    BulkOptions, Client, Config, Credentials, Error, IsolationLevel, NamedParam, Ready,
    RetryPolicy, SqlValue, TlsLifetime, VectorTypeSupport,
};
use mssql_testing::fixtures::{
    int, int_column, metadata, money_column, nvarchar, nvarchar_column, row, vector,
    vector_column,
};
use mssql_testing::{MockTdsServer, Reply, Request};
use mssql_types::Vector;
use mssql_types::money::decode_money;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config_for(server: &MockTdsServer) -> Config {
    init_tracing();
    Config::new()
        .host(server.host())
        .port(server.port())
        .database("inventory")
        .credentials(Credentials::sql_server("sa", "secret"))
        .retry(RetryPolicy::no_retry())
}

async fn connect(server: &MockTdsServer) -> Client<Ready> {
    Client::connect(config_for(server)).await.unwrap()
}

#[tokio::test]
async fn test_connect_negotiates_session() {
    let server = MockTdsServer::builder()
        .with_server_name("Inventory")
        .with_database("inventory")
        .with_json_support(1)
        .build()
        .await
        .unwrap();

    let client = Client::connect(config_for(&server).packet_size(8192))
        .await
        .unwrap();

    let session = client.session();
    assert_eq!(session.server_name(), Some("Inventory"));
    assert_eq!(session.database(), Some("inventory"));
    assert_eq!(session.packet_size(), 8192);
    assert_eq!(session.tls(), TlsLifetime::None);
    assert!(session.features().json_supported);
    assert!(!client.is_poisoned());

    let logins = server.logins().await;
    assert_eq!(logins.len(), 1);
    assert_eq!(logins[0].username, "sa");
    assert_eq!(logins[0].database, "inventory");
    assert_eq!(logins[0].packet_size, 8192);
}

#[tokio::test]
async fn test_query_result_set() {
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
            _ => Reply::affected(0),
        })
        .build()
        .await
        .unwrap();
    let mut client = connect(&server).await;

    let result = client.query("SELECT id, name FROM users", &[]).await.unwrap();
    let rows = result.rows();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get::<i32>(0).unwrap(), 1);
    assert_eq!(rows[0].get_by_name::<String>("name").unwrap(), "Alice");
    assert!(rows[1].is_null(1));
    assert_eq!(rows[1].try_get::<String>(1), None);
    assert_eq!(result.rows_affected(), 2);

    let requests = server.requests().await;
    assert!(matches!(&requests[0], Request::Batch { sql, descriptor: 0 } if sql.starts_with("SELECT")));
}

#[tokio::test]
async fn test_positional_parameters_use_executesql() {
    let server = MockTdsServer::builder()
        .with_handler(|_: &Request| Reply::affected(3))
        .build()
        .await
        .unwrap();
    let mut client = connect(&server).await;

    let affected = client
        .execute(
            "UPDATE users SET name = @p2 WHERE id = @p1",
            &[&7i32, &"Bob"],
        )
        .await
        .unwrap();
    assert_eq!(affected, 3);

    let requests = server.requests().await;
    assert_eq!(
        requests[0].statement().as_deref(),
        Some("UPDATE users SET name = @p2 WHERE id = @p1")
    );
    assert_eq!(
        requests[0].param_declarations().as_deref(),
        Some("@p1 int, @p2 nvarchar(4000)")
    );
}

#[tokio::test]
async fn test_procedure_call_return_status() {
    let server = MockTdsServer::builder()
        .with_handler(|_: &Request| Reply::new().return_status(7).done(None))
        .build()
        .await
        .unwrap();
    let mut client = connect(&server).await;

    let result = client
        .call("dbo.archive_orders", &[NamedParam::new("days", SqlValue::Int(30))])
        .await
        .unwrap();
    assert_eq!(result.return_status(), Some(7));

    let requests = server.requests().await;
    let Request::Rpc { request, .. } = &requests[0] else {
        unreachable!("procedure call must be sent as RPC, got {:?}", requests[0]);
    };
    assert_eq!(request.params.len(), 1);
    assert_eq!(request.params[0].name, "@days");
}

#[tokio::test]
async fn test_vector_column_and_parameters() {
    let server = MockTdsServer::builder()
        .with_handler(|request: &Request| match request.statement().as_deref() {
            Some("SELECT embedding FROM docs") => Reply::new()
                .result_set(
                    &metadata(vec![vector_column("embedding", 3)]),
                    &[row(vec![vector(&[0.5, -1.0, 2.0]).unwrap()])],
                )
                .unwrap()
                .done(Some(1)),
            _ => Reply::affected(0),
        })
        .build()
        .await
        .unwrap();

    let mut client = Client::connect(config_for(&server).vector_support(VectorTypeSupport::Native))
        .await
        .unwrap();

    let result = client.query("SELECT embedding FROM docs", &[]).await.unwrap();
    let set = &result.result_sets()[0];
    assert_eq!(set.columns()[0].length(), Some(3));
    let embedding: Vector = set.rows()[0].get(0).unwrap();
    assert_eq!(embedding.dimensions(), 3);
    assert_eq!(embedding.values(), &[0.5, -1.0, 2.0]);

    let probe = Vector::new(vec![1.0, 2.0, 3.0]).unwrap();
    client
        .query("SELECT TOP 1 id FROM docs ORDER BY VECTOR_DISTANCE('cosine', embedding, @p1)", &[&probe])
        .await
        .unwrap();

    let requests = server.requests().await;
    assert_eq!(requests[1].param_declarations().as_deref(), Some("@p1 vector(3)"));
}

#[tokio::test]
async fn test_vector_insert_then_select() {
    let stored = std::sync::Arc::new(std::sync::Mutex::new(None));
    let cell = stored.clone();
    let server = MockTdsServer::builder()
        .with_handler(move |request: &Request| match request {
            Request::Rpc { request: rpc, .. }
                if request.statement().as_deref()
                    == Some("INSERT INTO docs (embedding) VALUES (@p1)") =>
            {
                *cell.lock().unwrap() = rpc.params[2].value.clone();
                Reply::affected(1)
            }
            _ if request.statement().as_deref() == Some("SELECT embedding FROM docs") => {
                let value = cell.lock().unwrap().clone();
                Reply::new()
                    .result_set(&metadata(vec![vector_column("embedding", 3)]), &[row(vec![value])])
                    .unwrap()
                    .done(Some(1))
            }
            _ => Reply::affected(0),
        })
        .build()
        .await
        .unwrap();

    let mut client = Client::connect(config_for(&server).vector_support(VectorTypeSupport::Native))
        .await
        .unwrap();

    let embedding = Vector::new(vec![1.0, 2.0, 3.0]).unwrap();
    let inserted = client
        .execute("INSERT INTO docs (embedding) VALUES (@p1)", &[&embedding])
        .await
        .unwrap();
    assert_eq!(inserted, 1);
    assert!(stored.lock().unwrap().is_some());

    let result = client.query("SELECT embedding FROM docs", &[]).await.unwrap();
    let selected: Vector = result.rows()[0].get(0).unwrap();
    assert_eq!(selected.dimensions(), 3);
    assert_eq!(selected.values(), &[1.0, 2.0, 3.0]);
}

#[tokio::test]
async fn test_vector_parameters_fall_back_to_json() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let mut client = connect(&server).await;

    let probe = Vector::new(vec![1.0, 2.0, 3.0]).unwrap();
    client.query("SELECT @p1", &[&probe]).await.unwrap();

    let requests = server.requests().await;
    assert_eq!(
        requests[0].param_declarations().as_deref(),
        Some("@p1 nvarchar(max)")
    );
}

#[tokio::test]
async fn test_bulk_insert_money_precision() {
    let server = MockTdsServer::builder()
        .with_handler(|request: &Request| match request {
            Request::Batch { sql, .. } if sql.starts_with("SET FMTONLY ON") => Reply::new()
                .result_set(
                    &metadata(vec![int_column("id"), money_column("price")]),
                    &[],
                )
                .unwrap()
                .done(None),
            Request::BulkLoad { rows, .. } => Reply::affected(rows.len() as u64),
            _ => Reply::affected(0),
        })
        .build()
        .await
        .unwrap();
    let mut client = connect(&server).await;

    let first: [&(dyn mssql_client::ToSql + Sync); 2] = [&1i32, &"882342757768.9998"];
    let second: [&(dyn mssql_client::ToSql + Sync); 2] = [&2i32, &"-1.25"];
    let result = client
        .bulk_insert(
            "dbo.prices",
            &[],
            &BulkOptions::default(),
            &[&first[..], &second[..]],
        )
        .await
        .unwrap();
    assert_eq!(result.rows_sent, 2);
    assert_eq!(result.rows_affected, 2);

    let requests = server.requests().await;
    assert_eq!(requests.len(), 3);
    assert_eq!(
        requests[0].statement().as_deref(),
        Some("SET FMTONLY ON select * from dbo.prices SET FMTONLY OFF")
    );
    assert_eq!(
        requests[1].statement().as_deref(),
        Some("insert bulk dbo.prices ([id] int, [price] money) with (KEEP_NULLS)")
    );

    let Request::BulkLoad {
        rows, row_count, ..
    } = &requests[2]
    else {
        unreachable!("third request must be the bulk load, got {:?}", requests[2]);
    };
    assert_eq!(*row_count, Some(2));
    let price = rows[0].values[1].as_deref().unwrap();
    assert_eq!(decode_money(price).unwrap(), 8_823_427_577_689_998);
    let price = rows[1].values[1].as_deref().unwrap();
    assert_eq!(decode_money(price).unwrap(), -12_500);
}

#[tokio::test]
async fn test_transaction_descriptor_flows_into_requests() {
    let server = MockTdsServer::builder()
        .with_handler(|request: &Request| {
            let sql = request.statement().unwrap_or_default();
            if sql.ends_with("BEGIN TRANSACTION") {
                Reply::new().begin_transaction(5).done(None)
            } else if sql.contains("COMMIT TRANSACTION") {
                Reply::new().commit_transaction(5).done(None)
            } else {
                Reply::affected(1)
            }
        })
        .build()
        .await
        .unwrap();
    let client = connect(&server).await;

    let mut tx = client
        .begin_transaction(IsolationLevel::Serializable)
        .await
        .unwrap();
    assert_eq!(tx.descriptor(), 5);
    tx.execute("DELETE FROM carts WHERE id = @p1", &[&9i32])
        .await
        .unwrap();
    let client = tx.commit().await.unwrap();
    assert_eq!(client.session().transaction_descriptor(), 0);

    let requests = server.requests().await;
    assert_eq!(requests.len(), 3);
    assert_eq!(
        requests[0].statement().as_deref(),
        Some("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE; BEGIN TRANSACTION")
    );
    assert_eq!(requests[0].descriptor(), Some(0));
    assert_eq!(requests[1].descriptor(), Some(5));
    assert_eq!(requests[2].descriptor(), Some(5));
    assert_eq!(
        requests[2].statement().as_deref(),
        Some("IF @@TRANCOUNT > 0 COMMIT TRANSACTION")
    );
}

#[tokio::test]
async fn test_rollback_clears_descriptor() {
    let server = MockTdsServer::builder()
        .with_handler(|request: &Request| {
            let sql = request.statement().unwrap_or_default();
            if sql.ends_with("BEGIN TRANSACTION") {
                Reply::new().begin_transaction(0x0102).done(None)
            } else {
                Reply::new().rollback_transaction(0x0102).done(None)
            }
        })
        .build()
        .await
        .unwrap();
    let client = connect(&server).await;

    let tx = client.begin_transaction(IsolationLevel::default()).await.unwrap();
    assert_eq!(tx.descriptor(), 0x0102);
    let client = tx.rollback().await.unwrap();
    assert_eq!(client.session().transaction_descriptor(), 0);
}

#[tokio::test]
async fn test_server_error_keeps_connection_usable() {
    let server = MockTdsServer::builder()
        .with_handler(|request: &Request| match request.statement().as_deref() {
            Some("SELECT * FROM nope") => {
                Reply::new().error(208, 16, "Invalid object name 'nope'.")
            }
            _ => Reply::new().info(5701, "Changed database context.").done(None),
        })
        .build()
        .await
        .unwrap();
    let mut client = connect(&server).await;

    let err = client.batch("SELECT * FROM nope").await.unwrap_err();
    assert!(err.is_server_error(208));
    assert_eq!(err.class(), Some(16));
    assert!(!client.is_poisoned());

    let result = client.batch("USE inventory").await.unwrap();
    assert_eq!(result.messages().len(), 1);
    assert_eq!(result.messages()[0].number, 5701);
}

#[tokio::test]
async fn test_malformed_response_poisons_connection() {
    let server = MockTdsServer::builder()
        .with_handler(|request: &Request| match request.statement().as_deref() {
            Some("SELECT poison") => Reply::new().raw(&[0x01]),
            _ => Reply::affected(0),
        })
        .build()
        .await
        .unwrap();
    let mut client = connect(&server).await;

    let err = client.batch("SELECT poison").await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
    assert!(client.is_poisoned());

    let err = client.batch("SELECT 1").await.unwrap_err();
    assert!(matches!(err, Error::Poisoned));
    assert_eq!(server.requests().await.len(), 1);
}

#[tokio::test]
async fn test_login_error_is_reported() {
    let server = MockTdsServer::builder()
        .with_login_error(18456, "Login failed for user 'sa'.")
        .build()
        .await
        .unwrap();

    let err = Client::connect(config_for(&server)).await.unwrap_err();
    assert!(err.is_server_error(18456));
    assert!(!err.is_transient());
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn test_routing_is_followed() {
    let replica = MockTdsServer::builder()
        .with_server_name("replica")
        .build()
        .await
        .unwrap();
    let gateway = MockTdsServer::builder()
        .with_routing(replica.host(), replica.port())
        .build()
        .await
        .unwrap();

    let client = connect(&gateway).await;
    assert_eq!(client.session().server_name(), Some("replica"));
    assert_eq!(client.config().port, replica.port());
    assert_eq!(gateway.connection_count(), 1);
    assert_eq!(replica.connection_count(), 1);
}

#[tokio::test]
async fn test_close() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let client = connect(&server).await;
    client.close().await.unwrap();
}

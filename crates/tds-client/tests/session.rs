//! Client sessions against the mock TDS server.
//!
//! These run without a database:
//!
//! ```bash
//! cargo test -p tds-client --test session
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use tds_client::{
    Client, Config, EXECUTE_FAILED, Encryption, Error, Event, NO_COUNT, ParamDescriptor, RpcRequest,
    SqlValue, SslMode,
};
use tds_protocol::{DoneStatus, EncryptionLevel, PacketType, TdsVersion};
use tds_testing::fixtures::{self, Statement};
use tds_testing::{MockColumn, MockResponse, MockTdsServer, TokenWriter};
use tds_types::TypeId;

fn config(server: &MockTdsServer) -> Config {
    Config::from_connection_string(&format!(
        "Server={},{};User Id=sa;Password=secret;Database=master",
        server.host(),
        server.port()
    ))
    .unwrap()
}

fn sybase_config(server: &MockTdsServer) -> Config {
    Config::from_connection_string(&format!(
        "Server={},{};ServerType=sybase;User Id=sa;Password=secret",
        server.host(),
        server.port()
    ))
    .unwrap()
}

async fn connect(server: &MockTdsServer) -> Client {
    Client::connect(config(server)).await.expect("connect")
}

#[tokio::test]
async fn test_connect_and_select_scalar() {
    let server = MockTdsServer::builder()
        .with_database("sales")
        .with_response("SELECT 1", MockResponse::scalar(1i32))
        .build()
        .await
        .unwrap();

    let mut client = connect(&server).await;
    assert_eq!(client.version(), TdsVersion::V7_1);
    assert_eq!(client.database(), "sales");
    assert_eq!(client.server_info().unwrap().program, "Microsoft SQL Server");
    assert_eq!(client.server_version(), Some((8, 0, 2039)));
    assert_eq!(client.encryption(), Encryption::Plain);

    let response = client.query("select 1").await.unwrap();
    assert_eq!(response.scalar(), Some(&SqlValue::Int(1)));
    // SELECT completions carry no update count.
    assert!(response.update_counts.is_empty());

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_event_stream() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::rows(
            vec![MockColumn::int("id"), MockColumn::nvarchar("name", 20)],
            vec![
                vec![SqlValue::Int(1), SqlValue::from("a")],
                vec![SqlValue::Int(2), SqlValue::Null],
            ],
        ))
        .build()
        .await
        .unwrap();

    let mut client = connect(&server).await;
    client.submit_sql("SELECT id, name FROM t").await.unwrap();

    match client.next_event().await.unwrap() {
        Event::ResultSet(columns) => {
            assert_eq!(columns.len(), 2);
            assert_eq!(columns[1].name, "name");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(
        client.next_event().await.unwrap(),
        Event::Row(vec![SqlValue::Int(1), SqlValue::from("a")])
    );
    assert_eq!(
        client.next_event().await.unwrap(),
        Event::Row(vec![SqlValue::Int(2), SqlValue::Null])
    );
    assert!(matches!(client.next_event().await.unwrap(), Event::Done(_)));
    assert_eq!(client.next_event().await.unwrap(), Event::End);
    assert_eq!(client.next_event().await.unwrap(), Event::End);
}

#[tokio::test]
async fn test_unread_response_is_discarded() {
    let server = MockTdsServer::builder()
        .with_response(
            "SELECT rows",
            MockResponse::rows(
                vec![MockColumn::int("n")],
                vec![vec![SqlValue::Int(1)], vec![SqlValue::Int(2)]],
            ),
        )
        .with_response("SELECT 2", MockResponse::scalar(2i32))
        .build()
        .await
        .unwrap();

    let mut client = connect(&server).await;
    client.submit_sql("SELECT rows").await.unwrap();
    assert!(matches!(client.next_event().await.unwrap(), Event::ResultSet(_)));

    let response = client.query("SELECT 2").await.unwrap();
    assert_eq!(response.scalar(), Some(&SqlValue::Int(2)));
}

#[tokio::test]
async fn test_parameters_are_substituted() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::affected(1))
        .build()
        .await
        .unwrap();

    let mut client = connect(&server).await;
    let response = client
        .query_with_params(
            "UPDATE t SET name = ? WHERE id = ?",
            &[SqlValue::from("O'Brien"), SqlValue::Int(7)],
        )
        .await
        .unwrap();
    assert_eq!(response.update_counts, vec![1]);

    let requests = server.requests().await;
    assert_eq!(
        requests.last().unwrap().text,
        "UPDATE t SET name = N'O''Brien' WHERE id = 7"
    );

    let err = client
        .query_with_params("SELECT ?", &[])
        .await
        .unwrap_err();
    assert_eq!(err.sqlstate(), "07002");
    assert!(!client.is_closed());
}

#[tokio::test]
async fn test_procedure_outputs_and_return_status() {
    let response = fixtures::procedure_call(
        TdsVersion::V7_1,
        3,
        &[("@total", SqlValue::Int(42))],
        5,
    )
    .unwrap();
    let server = MockTdsServer::builder()
        .with_rpc_response("update_totals", response)
        .build()
        .await
        .unwrap();

    let mut client = connect(&server).await;
    let rpc = RpcRequest::new("update_totals")
        .param(ParamDescriptor::return_value())
        .param(ParamDescriptor::input("@region", 1i32))
        .param(ParamDescriptor::output("@total", TypeId::IntN));
    let response = client.execute_rpc(&rpc).await.unwrap();

    assert_eq!(response.update_counts, vec![3]);
    assert_eq!(response.return_status, Some(5));
    assert_eq!(response.output("@total"), Some(&SqlValue::Int(42)));
    assert_eq!(response.return_value(), Some(&SqlValue::Int(5)));

    let requests = server.requests().await;
    assert_eq!(requests.last().unwrap().packet_type, PacketType::Rpc);
    assert_eq!(requests.last().unwrap().text, "update_totals");
}

#[tokio::test]
async fn test_function_return_value_wins_over_status() {
    let response = fixtures::function_call(
        TdsVersion::V7_1,
        SqlValue::from("result"),
        TypeId::NVarChar,
    )
    .unwrap();
    let server = MockTdsServer::builder()
        .with_rpc_response("fn_name", response)
        .build()
        .await
        .unwrap();

    let mut client = connect(&server).await;
    let rpc = RpcRequest::new("fn_name").param(ParamDescriptor::return_value());
    let response = client.execute_rpc(&rpc).await.unwrap();

    assert_eq!(response.return_value(), Some(&SqlValue::from("result")));
    assert_eq!(response.return_status, Some(0));
}

#[tokio::test]
async fn test_sybase_batch_continues_past_failure() {
    let batch = fixtures::update_batch(
        TdsVersion::V5_0,
        &[
            Statement::Count(1),
            Statement::Fails {
                number: 2601,
                message: "Attempt to insert duplicate key row".into(),
            },
            Statement::Count(1),
        ],
    )
    .unwrap();
    let server = MockTdsServer::builder()
        .with_tds_version(TdsVersion::V5_0)
        .with_server_name("sql server")
        .with_default_response(batch)
        .build()
        .await
        .unwrap();

    let mut client = Client::connect(sybase_config(&server)).await.unwrap();
    assert_eq!(client.version(), TdsVersion::V5_0);

    let result = client
        .execute_batch(&[
            "INSERT INTO t VALUES (1)",
            "INSERT INTO t VALUES (1)",
            "INSERT INTO t VALUES (2)",
        ])
        .await
        .unwrap();

    assert_eq!(result.counts, vec![1, EXECUTE_FAILED, 1]);
    assert!(!result.is_success());
    let err = result.error.unwrap();
    assert_eq!(err.sqlstate(), "23000");
    assert!(err.is_server_error(2601));

    // One batch on the wire, statements joined by newlines.
    let requests = server.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].text.lines().count(), 3);
}

#[tokio::test]
async fn test_sybase_select_and_error() {
    let server = MockTdsServer::builder()
        .with_tds_version(TdsVersion::V5_0)
        .with_server_name("sql server")
        .with_response("SELECT 1", MockResponse::scalar(1i32))
        .with_response("SELECT * FROM missing", MockResponse::error(208, "missing not found"))
        .build()
        .await
        .unwrap();

    let mut client = Client::connect(sybase_config(&server)).await.unwrap();
    let response = client.query("select 1").await.unwrap();
    assert_eq!(response.scalar(), Some(&SqlValue::Int(1)));

    let err = client.query("SELECT * FROM missing").await.unwrap_err();
    assert!(err.is_server_error(208));
}

#[tokio::test]
async fn test_batch_without_counts() {
    let batch = fixtures::update_batch(
        TdsVersion::V7_1,
        &[Statement::NoCount, Statement::Count(4)],
    )
    .unwrap();
    let server = MockTdsServer::builder()
        .with_default_response(batch)
        .build()
        .await
        .unwrap();

    let mut client = connect(&server).await;
    let result = client
        .execute_batch(&["CREATE TABLE t (a int)", "INSERT INTO t SELECT 1"])
        .await
        .unwrap();
    assert_eq!(result.counts, vec![NO_COUNT, 4]);
    assert!(result.is_success());
}

#[tokio::test]
async fn test_server_error_and_severity_clamp() {
    let tokens = TokenWriter::new(TdsVersion::V7_1)
        .error(50000, 5, "low severity error")
        .done(DoneStatus::ERROR, 0, 0)
        .finish()
        .unwrap();
    let server = MockTdsServer::builder()
        .with_response("RAISERROR", MockResponse::tokens(tokens))
        .with_response("SELECT * FROM missing", MockResponse::error(208, "Invalid object name 'missing'."))
        .build()
        .await
        .unwrap();

    let mut client = connect(&server).await;

    let err = client.query("RAISERROR").await.unwrap_err();
    assert_eq!(err.class(), Some(11));
    assert_eq!(err.sqlstate(), "S1000");

    let err = client.query("SELECT * FROM missing").await.unwrap_err();
    assert_eq!(err.sqlstate(), "42S02");
    assert!(!err.is_fatal());
    assert!(!client.is_closed());
}

#[tokio::test]
async fn test_warnings_are_collected() {
    let tokens = TokenWriter::new(TdsVersion::V7_1)
        .info(8153, 10, "Warning: Null value is eliminated by an aggregate.")
        .update_count(2, false)
        .finish()
        .unwrap();
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::tokens(tokens))
        .build()
        .await
        .unwrap();

    let mut client = connect(&server).await;
    let response = client.query("UPDATE t SET a = 1").await.unwrap();
    assert_eq!(response.update_counts, vec![2]);
    assert_eq!(response.warnings.len(), 1);
    let warning = response.warnings.iter().next().unwrap();
    assert!(!warning.is_error());
    assert_eq!(warning.class, 9);
    assert_eq!(warning.sqlstate(), "01003");
}

#[tokio::test]
async fn test_cancel_from_another_task() {
    let server = MockTdsServer::builder()
        .with_response("WAITFOR DELAY '01:00'", MockResponse::Stall)
        .with_response("SELECT 1", MockResponse::scalar(1i32))
        .build()
        .await
        .unwrap();

    let mut client = connect(&server).await;
    client.submit_sql("WAITFOR DELAY '01:00'").await.unwrap();

    let cancel = client.cancel_handle();
    assert!(cancel.is_in_flight());
    let task = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel().await
    });

    let err = client.drain().await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(err.sqlstate(), "HY008");
    assert!(task.await.unwrap().unwrap());

    // The session survives a cancel.
    assert!(!client.is_closed());
    let response = client.query("SELECT 1").await.unwrap();
    assert_eq!(response.scalar(), Some(&SqlValue::Int(1)));
}

#[tokio::test]
async fn test_cancel_without_request_is_rejected() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let client = connect(&server).await;

    let err = client.cancel_handle().cancel().await.unwrap_err();
    assert!(matches!(err, Error::Sequence(_)));
}

#[tokio::test]
async fn test_command_timeout_cancels_and_recovers() {
    let server = MockTdsServer::builder()
        .with_response("WAITFOR DELAY '01:00'", MockResponse::Stall)
        .with_response("SELECT 1", MockResponse::scalar(1i32))
        .build()
        .await
        .unwrap();

    let config = config(&server).command_timeout(Duration::from_millis(100));
    let mut client = Client::connect(config).await.unwrap();

    let err = client.query("WAITFOR DELAY '01:00'").await.unwrap_err();
    assert!(matches!(err, Error::Timeout));
    assert_eq!(err.sqlstate(), "HYT00");
    assert!(!client.is_closed());

    let response = client.query("SELECT 1").await.unwrap();
    assert_eq!(response.scalar(), Some(&SqlValue::Int(1)));
}

#[tokio::test]
async fn test_packet_size_change() {
    let server = MockTdsServer::builder()
        .with_packet_size(8192)
        .build()
        .await
        .unwrap();

    let client = connect(&server).await;
    assert_eq!(client.packet_size(), 8192);
    assert_eq!(client.session().packet_size(), 8192);
}

#[tokio::test]
async fn test_fatal_error_closes_session() {
    let response = fixtures::fatal_error(TdsVersion::V7_1, 3624, "A system assertion check has failed.").unwrap();
    let server = MockTdsServer::builder()
        .with_default_response(response)
        .build()
        .await
        .unwrap();

    let mut client = connect(&server).await;
    let err = client.query("SELECT 1").await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(err.class(), Some(20));
    assert!(client.is_closed());

    let err = client.query("SELECT 1").await.unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed));
    assert_eq!(err.sqlstate(), "08003");
}

#[tokio::test]
async fn test_disconnect_mid_request() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::Disconnect)
        .build()
        .await
        .unwrap();

    let mut client = connect(&server).await;
    let err = client.query("SELECT 1").await.unwrap_err();
    assert!(err.is_fatal());
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_login_failure() {
    let server = MockTdsServer::builder()
        .with_login_error(18456, "Login failed for user 'sa'.")
        .build()
        .await
        .unwrap();

    let err = Client::connect(config(&server)).await.unwrap_err();
    assert_eq!(err.sqlstate(), "28000");
    assert!(err.is_server_error(18456));
}

#[tokio::test]
async fn test_required_encryption_unavailable() {
    let server = MockTdsServer::builder()
        .with_encryption(EncryptionLevel::NotSupported)
        .build()
        .await
        .unwrap();

    let config = config(&server).ssl(SslMode::Require);
    let err = Client::connect(config).await.unwrap_err();
    assert!(matches!(err, Error::Tls(_)));
    assert_eq!(err.sqlstate(), "08S01");
}

#[tokio::test]
async fn test_oversized_value_is_fatal() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::rows(
            vec![MockColumn::nvarchar("s", 4000)],
            vec![vec![SqlValue::from("x".repeat(2000))]],
        ))
        .build()
        .await
        .unwrap();

    let config = config(&server).max_value_size(1024);
    let mut client = Client::connect(config).await.unwrap();
    let err = client.query("SELECT s").await.unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted(_)));
    assert_eq!(err.sqlstate(), "HY001");
    assert!(client.is_closed());
}

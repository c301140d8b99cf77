//! Live server tests.
//!
//! Ignored by default. Point them at a server through the environment:
//!
//! ```bash
//! export TDS_TEST_URL='Server=localhost,1433;User Id=sa;Password=YourStrong@Passw0rd'
//! cargo test -p tds-client --test live -- --ignored
//! ```
//!
//! A disposable server can be started with the containers in `tds-testing`.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use tds_client::{Client, Config, EXECUTE_FAILED, ParamDescriptor, RpcRequest, SqlValue};
use tds_types::TypeId;

fn live_config() -> Option<Config> {
    let url = std::env::var("TDS_TEST_URL").ok()?;
    Config::from_connection_string(&url).ok()
}

async fn live_client() -> Client {
    let config = live_config().expect("TDS_TEST_URL must be set");
    Client::connect(config).await.expect("connect")
}

#[tokio::test]
#[ignore = "Requires a live server"]
async fn test_live_select() {
    let mut client = live_client().await;
    let response = client.query("SELECT 1").await.unwrap();
    assert_eq!(response.scalar(), Some(&SqlValue::Int(1)));
    client.close().await.unwrap();
}

#[tokio::test]
#[ignore = "Requires a live server"]
async fn test_live_batch_with_duplicate_key() {
    let mut client = live_client().await;
    client
        .query("CREATE TABLE #dup (id int PRIMARY KEY)")
        .await
        .unwrap();

    let result = client
        .execute_batch(&[
            "INSERT INTO #dup VALUES (1)",
            "INSERT INTO #dup VALUES (1)",
            "INSERT INTO #dup VALUES (2)",
        ])
        .await
        .unwrap();
    assert_eq!(result.counts, vec![1, EXECUTE_FAILED, 1]);
    assert_eq!(result.error.unwrap().sqlstate(), "23000");
}

#[tokio::test]
#[ignore = "Requires a live server"]
async fn test_live_output_parameter() {
    let mut client = live_client().await;
    client
        .query("CREATE PROCEDURE #double_it @n int, @out int OUTPUT AS BEGIN SET @out = @n * 2; RETURN 7 END")
        .await
        .unwrap();

    let rpc = RpcRequest::new("#double_it")
        .param(ParamDescriptor::return_value())
        .param(ParamDescriptor::input("@n", 21i32))
        .param(ParamDescriptor::output("@out", TypeId::IntN));
    let response = client.execute_rpc(&rpc).await.unwrap();
    assert_eq!(response.output("@out"), Some(&SqlValue::Int(42)));
    assert_eq!(response.return_status, Some(7));
}

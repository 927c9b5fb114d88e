//! Adapts an RPC endpoint to [`WorkerLink`]

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use judgehub_rpc::{Endpoint, RpcError};
use judgehub_server::{JobEnv, LinkError, WorkerLink};

pub struct RpcWorkerLink {
    hello: Value,
    endpoint: Arc<Endpoint>,
}

impl RpcWorkerLink {
    pub fn new(hello: Value, endpoint: Arc<Endpoint>) -> Self {
        Self { hello, endpoint }
    }
}

fn map_rpc_err(e: RpcError) -> LinkError {
    match e {
        RpcError::Remote { kind, message } => LinkError::Remote { kind, message },
        // every transport failure counts as loss
        _ => LinkError::Closed,
    }
}

#[async_trait]
impl WorkerLink for RpcWorkerLink {
    fn hello(&self) -> &Value {
        &self.hello
    }

    async fn run(&self, env: JobEnv) -> Result<JobEnv, LinkError> {
        let params = Value::Object(env.as_map().clone());
        match self.endpoint.call("run", params).await.map_err(map_rpc_err)? {
            Value::Object(map) => Ok(JobEnv::from_map(map)),
            other => Err(LinkError::Protocol(format!(
                "run result is not an object: {other}"
            ))),
        }
    }

    async fn get_running(&self) -> Result<Vec<String>, LinkError> {
        let value = self
            .endpoint
            .call("get_running", json!({}))
            .await
            .map_err(map_rpc_err)?;
        serde_json::from_value(value)
            .map_err(|e| LinkError::Protocol(format!("bad get_running reply: {e}")))
    }

    fn close(&self) {
        self.endpoint.close();
    }
}

//! Worker invocation over the function-service HTTP endpoint.

use serde::{Deserialize, Serialize};

/// Name of the deployed worker function.
const WORKER_FUNCTION: &str = "cirrus-worker";

/// The JSON payload handed to every invoked worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InvocationPayload {
    /// Storage backend URI the worker fetches scene objects from.
    pub storage_backend: String,

    /// The coordinator's public address as `"ip:port"`.
    pub coordinator: String,
}

/// The invocation endpoint for a region.
///
/// * `region` - The function-service region.
pub fn invocation_endpoint(region: &str) -> String {
    format!(
        "https://lambda.{region}.amazonaws.com/2015-03-31/functions/{WORKER_FUNCTION}/invocations"
    )
}

/// Fire off `count` asynchronous invocation requests. Responses are
/// event-style fire-and-forget; failures are logged, never retried —
/// workers that never connect are simply absent from the topology.
///
/// * `count`    - Number of workers to launch.
/// * `endpoint` - The invocation endpoint URL.
/// * `payload`  - The payload every worker receives.
pub fn launch_workers(count: u32, endpoint: &str, payload: &InvocationPayload) {
    let client = reqwest::Client::new();
    for _ in 0..count {
        let client = client.clone();
        let endpoint = endpoint.to_string();
        let payload = payload.clone();
        tokio::spawn(async move {
            if let Err(e) = client.post(&endpoint).json(&payload).send().await {
                error!("invocation request failed: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_includes_region_and_function() {
        let url = invocation_endpoint("us-west-2");
        assert!(url.contains("lambda.us-west-2.amazonaws.com"));
        assert!(url.contains("cirrus-worker"));
    }

    #[test]
    fn payload_serializes_to_the_wire_names() {
        let payload = InvocationPayload {
            storage_backend: "file:///dump".to_string(),
            coordinator: "10.0.0.1:50000".to_string(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"storage_backend\""));
        assert!(json.contains("\"coordinator\""));
    }
}

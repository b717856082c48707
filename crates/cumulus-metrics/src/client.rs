//! Authenticated JSON-RPC client for the monitoring service.
//!
//! The client starts unauthenticated and logs in lazily before the first
//! call. A "Not authorized" error clears the token, re-authenticates and
//! retries the call, at most `max_auth_retries` times. Transport failures
//! are retried forever with a fixed delay until the optional cancellation
//! signal fires. Any other RPC error is returned to the caller.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{MonitorError, MonitorResult, RpcError};
use crate::metric::Metric;
use crate::transport::RpcTransport;

/// Method used to obtain a token.
pub const AUTHENTICATE: &str = "user.authenticate";

/// A monitored host, addressed as `{name}-{id}`.
#[derive(Debug, Clone, PartialEq)]
pub struct HostRef {
    pub name: String,
    pub id: String,
}

impl HostRef {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
        }
    }

    pub fn monitored_name(&self) -> String {
        format!("{}-{}", self.name, self.id)
    }
}

/// Options of a [`MonitorClient::metric`] lookup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricQuery {
    /// Only the first host is queried.
    pub hosts: Vec<HostRef>,
    /// History type code; numeric kinds are coerced to numbers.
    pub kind: Option<u32>,
    /// Window start (unix seconds); defaults to `till - lookback`.
    pub from: Option<i64>,
    /// Window end (unix seconds); defaults to now.
    pub till: Option<i64>,
}

#[derive(Serialize)]
struct Envelope<'a> {
    jsonrpc: &'static str,
    auth: Option<&'a str>,
    id: u64,
    method: &'a str,
    params: &'a Value,
}

enum Reply {
    Result(Value),
    Error(RpcError),
}

/// Monitoring service client.
pub struct MonitorClient {
    transport: Arc<dyn RpcTransport>,
    username: String,
    password: String,
    token: Option<String>,
    request_id: u64,
    retry_delay: Duration,
    max_auth_retries: u32,
    lookback: Duration,
    cancel: Option<watch::Receiver<bool>>,
}

impl MonitorClient {
    pub fn new(
        transport: Arc<dyn RpcTransport>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            username: username.into(),
            password: password.into(),
            token: None,
            request_id: 0,
            retry_delay: Duration::from_secs(5),
            max_auth_retries: 3,
            lookback: Duration::from_secs(3600),
            cancel: None,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_max_auth_retries(mut self, retries: u32) -> Self {
        self.max_auth_retries = retries;
        self
    }

    pub fn with_lookback(mut self, lookback: Duration) -> Self {
        self.lookback = lookback;
        self
    }

    /// Abort transport retries once `cancel` turns true.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    /// Log in and store the returned token.
    pub async fn authenticate(&mut self) -> MonitorResult<()> {
        let params = json!({"user": self.username, "password": self.password});
        match self.call(AUTHENTICATE, &params).await? {
            Reply::Result(Value::String(token)) => {
                debug!(user = %self.username, "monitoring session authenticated");
                self.token = Some(token);
                Ok(())
            }
            Reply::Result(other) => Err(MonitorError::InvalidResponse {
                method: AUTHENTICATE.to_string(),
                reason: format!("expected a token, got {other}"),
            }),
            Reply::Error(error) => Err(MonitorError::AuthenticationFailed {
                user: self.username.clone(),
                error,
            }),
        }
    }

    /// Call `method`, logging in first when there is no token.
    pub async fn request(&mut self, method: &str, params: Value) -> MonitorResult<Value> {
        if method == AUTHENTICATE {
            return match self.call(method, &params).await? {
                Reply::Result(value) => Ok(value),
                Reply::Error(error) => Err(MonitorError::AuthenticationFailed {
                    user: self.username.clone(),
                    error,
                }),
            };
        }

        let mut reauthentications = 0;
        loop {
            if self.token.is_none() {
                self.authenticate().await?;
            }
            match self.call(method, &params).await? {
                Reply::Result(value) => return Ok(value),
                Reply::Error(error) if error.is_not_authorized() => {
                    self.token = None;
                    if reauthentications >= self.max_auth_retries {
                        return Err(MonitorError::AuthRejected {
                            method: method.to_string(),
                            attempts: reauthentications,
                        });
                    }
                    reauthentications += 1;
                    info!(%method, attempt = reauthentications, "token rejected, re-authenticating");
                }
                Reply::Error(error) => {
                    return Err(MonitorError::Rpc {
                        method: method.to_string(),
                        error,
                    });
                }
            }
        }
    }

    /// History of item `name` on the first host of `query`.
    ///
    /// At most the first two matching items are read.
    pub async fn metric(&mut self, name: &str, query: &MetricQuery) -> MonitorResult<Metric> {
        let host = query
            .hosts
            .first()
            .map(|h| Value::String(h.monitored_name()))
            .unwrap_or(Value::Null);
        let items = self
            .request(
                "item.get",
                json!({"filter": {"host": host.clone(), "key_": name}, "output": "extend"}),
            )
            .await?;
        let item_ids: Vec<Value> = items
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.get("itemid").cloned())
                    .take(2)
                    .collect()
            })
            .unwrap_or_default();

        let till = query.till.unwrap_or_else(now_secs);
        let from = query
            .from
            .unwrap_or_else(|| till - self.lookback.as_secs() as i64);
        let mut params = json!({
            "itemids": item_ids,
            "output": "extend",
            "time_from": from,
            "time_till": till,
        });
        if let (Some(kind), Some(map)) = (query.kind, params.as_object_mut()) {
            map.insert("history".to_string(), json!(kind));
        }
        let history = self.request("history.get", params).await?;
        let metric = Metric::from_history(name, query.kind, &history);
        debug!(metric = %name, %host, samples = metric.len(), "metric fetched");
        Ok(metric)
    }

    /// Send one call, retrying transport failures until a body parses.
    async fn call(&mut self, method: &str, params: &Value) -> MonitorResult<Reply> {
        loop {
            self.request_id += 1;
            let body = serde_json::to_vec(&Envelope {
                jsonrpc: "2.0",
                auth: self.token.as_deref(),
                id: self.request_id,
                method,
                params,
            })
            .map_err(|e| MonitorError::InvalidResponse {
                method: method.to_string(),
                reason: e.to_string(),
            })?;

            let bytes = match self.transport.post(body).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(%method, error = %e, delay = ?self.retry_delay, "monitoring call failed, retrying");
                    self.pause(method).await?;
                    continue;
                }
            };

            let response: Value =
                serde_json::from_slice(&bytes).map_err(|e| MonitorError::InvalidResponse {
                    method: method.to_string(),
                    reason: e.to_string(),
                })?;
            return match response.get("error") {
                Some(error) if !error.is_null() => {
                    let error: RpcError = serde_json::from_value(error.clone()).map_err(|e| {
                        MonitorError::InvalidResponse {
                            method: method.to_string(),
                            reason: e.to_string(),
                        }
                    })?;
                    Ok(Reply::Error(error))
                }
                _ => Ok(Reply::Result(
                    response.get("result").cloned().unwrap_or(Value::Null),
                )),
            };
        }
    }

    /// Sleep the retry delay, or stop if cancelled.
    async fn pause(&self, method: &str) -> MonitorResult<()> {
        let cancelled = || MonitorError::Cancelled {
            method: method.to_string(),
        };
        let Some(mut cancel) = self.cancel.clone() else {
            tokio::time::sleep(self.retry_delay).await;
            return Ok(());
        };
        if *cancel.borrow() {
            return Err(cancelled());
        }
        tokio::select! {
            _ = tokio::time::sleep(self.retry_delay) => Ok(()),
            changed = cancel.wait_for(|c| *c) => match changed {
                Ok(_) => Err(cancelled()),
                // Sender gone: nothing can cancel any more.
                Err(_) => {
                    tokio::time::sleep(self.retry_delay).await;
                    Ok(())
                }
            },
        }
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::metric::NUMERIC;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned replies and records every request body.
    #[derive(Default)]
    struct ScriptedTransport {
        replies: Mutex<VecDeque<Result<Value, TransportError>>>,
        sent: Mutex<Vec<Value>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Result<Value, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<Value> {
            self.sent.lock().unwrap().clone()
        }

        fn methods(&self) -> Vec<String> {
            self.sent()
                .iter()
                .map(|r| r["method"].as_str().unwrap().to_string())
                .collect()
        }
    }

    #[async_trait]
    impl RpcTransport for ScriptedTransport {
        async fn post(&self, body: Vec<u8>) -> Result<Vec<u8>, TransportError> {
            self.sent
                .lock()
                .unwrap()
                .push(serde_json::from_slice(&body).unwrap());
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .expect("script exhausted");
            reply.map(|v| serde_json::to_vec(&v).unwrap())
        }
    }

    fn ok(result: Value) -> Result<Value, TransportError> {
        Ok(json!({"jsonrpc": "2.0", "result": result, "id": 1}))
    }

    fn not_authorized() -> Result<Value, TransportError> {
        Ok(json!({"jsonrpc": "2.0", "error": {
            "code": -32602, "message": "Invalid params.", "data": "Not authorized"
        }, "id": 1}))
    }

    fn client(transport: Arc<ScriptedTransport>) -> MonitorClient {
        MonitorClient::new(transport, "Admin", "secret")
    }

    #[tokio::test]
    async fn first_request_authenticates_lazily() {
        let transport = ScriptedTransport::new(vec![ok(json!("tok-1")), ok(json!([]))]);
        let mut c = client(transport.clone());
        assert!(!c.is_authenticated());

        let result = c.request("item.get", json!({})).await.unwrap();
        assert_eq!(result, json!([]));
        assert!(c.is_authenticated());

        let sent = transport.sent();
        assert_eq!(sent[0]["method"], "user.authenticate");
        assert_eq!(sent[0]["auth"], Value::Null);
        assert_eq!(sent[0]["params"], json!({"user": "Admin", "password": "secret"}));
        assert_eq!(sent[0]["id"], 1);
        assert_eq!(sent[0]["jsonrpc"], "2.0");
        assert_eq!(sent[1]["auth"], "tok-1");
        assert_eq!(sent[1]["id"], 2);
    }

    #[tokio::test]
    async fn not_authorized_reauthenticates_once() {
        let transport = ScriptedTransport::new(vec![
            ok(json!("tok-1")),
            not_authorized(),
            ok(json!("tok-2")),
            ok(json!(["done"])),
        ]);
        let mut c = client(transport.clone());
        let result = c.request("item.get", json!({})).await.unwrap();
        assert_eq!(result, json!(["done"]));
        assert_eq!(
            transport.methods(),
            vec!["user.authenticate", "item.get", "user.authenticate", "item.get"]
        );
        assert_eq!(transport.sent()[3]["auth"], "tok-2");
    }

    #[tokio::test]
    async fn repeated_rejection_is_capped() {
        let transport = ScriptedTransport::new(vec![
            ok(json!("t1")),
            not_authorized(),
            ok(json!("t2")),
            not_authorized(),
        ]);
        let mut c = client(transport.clone()).with_max_auth_retries(1);
        let err = c.request("item.get", json!({})).await.unwrap_err();
        assert!(matches!(err, MonitorError::AuthRejected { attempts: 1, .. }));
        assert!(!c.is_authenticated());
    }

    #[tokio::test]
    async fn other_rpc_errors_are_fatal() {
        let transport = ScriptedTransport::new(vec![
            ok(json!("t1")),
            Ok(json!({"error": {"code": -32500, "message": "Application error.", "data": "No such item"}})),
        ]);
        let mut c = client(transport);
        let err = c.request("history.get", json!({})).await.unwrap_err();
        match err {
            MonitorError::Rpc { method, error } => {
                assert_eq!(method, "history.get");
                assert_eq!(error.code, -32500);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn rejected_credentials_are_fatal() {
        let transport = ScriptedTransport::new(vec![Ok(json!({"error": {
            "code": -32602, "message": "Invalid params.", "data": "Login name or password is incorrect"
        }}))]);
        let mut c = client(transport.clone());
        let err = c.request("item.get", json!({})).await.unwrap_err();
        assert!(matches!(err, MonitorError::AuthenticationFailed { .. }));
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_are_retried() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Request("connection reset".to_string())),
            Err(TransportError::Status { status: 502 }),
            ok(json!("tok")),
            ok(json!(42)),
        ]);
        let mut c = client(transport.clone());
        let started = tokio::time::Instant::now();
        let result = c.request("item.get", json!({})).await.unwrap();
        assert_eq!(result, json!(42));
        // Two fixed 5s pauses, no backoff growth.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(10) && waited < Duration::from_secs(11));
        // Every attempt carries a fresh id.
        let ids: Vec<u64> = transport
            .sent()
            .iter()
            .map(|r| r["id"].as_u64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_transport_retries() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Request("down".to_string())),
            Err(TransportError::Request("down".to_string())),
        ]);
        let (tx, rx) = watch::channel(false);
        let mut c = client(transport).with_cancellation(rx);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            let _ = tx.send(true);
        });
        let err = c.request("item.get", json!({})).await.unwrap_err();
        // The lazy login is the call that kept failing.
        assert!(matches!(&err, MonitorError::Cancelled { method } if method == AUTHENTICATE));
    }

    #[tokio::test]
    async fn unparsable_body_is_fatal() {
        #[derive(Default)]
        struct Garbage;
        #[async_trait]
        impl RpcTransport for Garbage {
            async fn post(&self, _body: Vec<u8>) -> Result<Vec<u8>, TransportError> {
                Ok(b"<html>oops</html>".to_vec())
            }
        }
        let mut c = MonitorClient::new(Arc::new(Garbage), "Admin", "pw");
        let err = c.authenticate().await.unwrap_err();
        assert!(matches!(err, MonitorError::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn metric_uses_first_host_and_two_items() {
        let transport = ScriptedTransport::new(vec![
            ok(json!("tok")),
            ok(json!([{"itemid": "11"}, {"itemid": "12"}, {"itemid": "13"}])),
            ok(json!([
                {"itemid": "11", "clock": "3", "value": "12.5"},
                {"itemid": "11", "clock": "2", "value": "9.0"},
                {"itemid": "11", "clock": "1", "value": "5.0"},
            ])),
        ]);
        let mut c = client(transport.clone());
        let query = MetricQuery {
            hosts: vec![
                HostRef::new("server-experiment7", "42"),
                HostRef::new("other", "43"),
            ],
            kind: Some(NUMERIC),
            from: Some(1_000),
            till: Some(4_600),
        };
        let metric = c
            .metric("system.cpu.util[,system,avg1]", &query)
            .await
            .unwrap();
        assert_eq!(metric.numbers(), Some(vec![5.0, 9.0, 12.5]));

        let sent = transport.sent();
        assert_eq!(
            sent[1]["params"],
            json!({
                "filter": {"host": "server-experiment7-42", "key_": "system.cpu.util[,system,avg1]"},
                "output": "extend"
            })
        );
        assert_eq!(
            sent[2]["params"],
            json!({
                "itemids": ["11", "12"],
                "output": "extend",
                "time_from": 1_000,
                "time_till": 4_600,
                "history": 0
            })
        );
    }

    #[tokio::test]
    async fn metric_defaults_to_trailing_hour_without_type() {
        let transport =
            ScriptedTransport::new(vec![ok(json!("tok")), ok(json!([])), ok(json!([]))]);
        let mut c = client(transport.clone());
        let metric = c.metric("agent.ping", &MetricQuery::default()).await.unwrap();
        assert!(metric.is_empty());

        let sent = transport.sent();
        assert_eq!(sent[1]["params"]["filter"]["host"], Value::Null);
        let history = &sent[2]["params"];
        assert!(history.get("history").is_none());
        let from = history["time_from"].as_i64().unwrap();
        let till = history["time_till"].as_i64().unwrap();
        assert_eq!(till - from, 3600);
    }
}

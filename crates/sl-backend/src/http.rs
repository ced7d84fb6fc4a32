//! GraphQL client for the experiment-tracking backend, plus checksummed file
//! upload.

use async_trait::async_trait;
use base64::Engine;
use md5::{Digest, Md5};
use serde_json::{json, Value};
use sl_types::{BackendError, BackendResult, QueuedRun, QueuedRunStatus};
use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::{
    AgentConfig, ArtifactSpec, LaunchQueue, LaunchRequest, RunRecord, SweepBackend, SweepRecord,
    UpsertRun,
};
use crate::retry::RetryPolicy;

/// Connection settings for [`GraphqlClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct BackendSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl BackendSettings {
    pub const DEFAULT_BASE_URL: &'static str = "http://localhost:8080";

    /// Read `SWEEPLINE_BASE_URL` and `SWEEPLINE_API_KEY`.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Ok(url) = std::env::var("SWEEPLINE_BASE_URL") {
            settings.base_url = url.trim_end_matches('/').to_string();
        }
        settings.api_key = std::env::var("SWEEPLINE_API_KEY")
            .ok()
            .filter(|key| !key.is_empty());
        settings
    }
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

fn transport_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Transient {
            message: e.to_string(),
        }
    } else {
        BackendError::Communication {
            message: e.to_string(),
        }
    }
}

fn invalid(message: impl Into<String>) -> BackendError {
    BackendError::InvalidResponse {
        message: message.into(),
    }
}

/// Non-null value at a JSON pointer.
fn field<'a>(data: &'a Value, pointer: &str) -> BackendResult<&'a Value> {
    match data.pointer(pointer) {
        Some(Value::Null) | None => Err(invalid(format!("missing {pointer} in response"))),
        Some(value) => Ok(value),
    }
}

fn string_field(data: &Value, pointer: &str) -> BackendResult<String> {
    field(data, pointer)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| invalid(format!("{pointer} is not a string")))
}

/// Base64-encoded MD5 digest, the form `Content-MD5` expects.
pub fn md5_base64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(Md5::digest(data))
}

/// HTTP client for the backend's GraphQL endpoint.
#[derive(Debug, Clone)]
pub struct GraphqlClient {
    client: reqwest::Client,
    settings: BackendSettings,
}

impl GraphqlClient {
    pub fn new(settings: BackendSettings) -> BackendResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(transport_error)?;
        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> &BackendSettings {
        &self.settings
    }

    /// Run one GraphQL operation and return its `data` object. Transport
    /// failures and 5xx responses are retried.
    pub async fn execute(&self, query: &str, variables: Value) -> BackendResult<Value> {
        let variables = &variables;
        self.settings
            .retry
            .run("graphql request", move || self.execute_once(query, variables))
            .await
    }

    async fn execute_once(&self, query: &str, variables: &Value) -> BackendResult<Value> {
        let mut request = self
            .client
            .post(format!("{}/graphql", self.settings.base_url))
            .json(&json!({ "query": query, "variables": variables }));
        if let Some(key) = &self.settings.api_key {
            request = request.basic_auth("api", Some(key));
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(BackendError::Http {
                status: status.as_u16(),
                message: body,
            });
        }

        let payload: Value = serde_json::from_str(&body).map_err(|e| invalid(e.to_string()))?;
        if let Some(error) = payload
            .get("errors")
            .and_then(Value::as_array)
            .and_then(|errors| errors.first())
        {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown GraphQL error");
            return Err(invalid(message));
        }
        Ok(payload.get("data").cloned().unwrap_or(Value::Null))
    }

    /// PUT a file to a (pre-signed) URL with a `Content-MD5` header.
    ///
    /// `progress` receives the number of bytes sent per attempt, and the
    /// negated count when an attempt fails and the reader is rewound.
    pub async fn upload_file<R>(
        &self,
        url: &str,
        reader: &mut R,
        extra_headers: &[(String, String)],
        progress: &mut (dyn FnMut(i64) + Send),
    ) -> BackendResult<()>
    where
        R: Read + Seek + Send,
    {
        let mut body = Vec::new();
        reader.seek(SeekFrom::Start(0))?;
        reader.read_to_end(&mut body)?;
        let checksum = md5_base64(&body);
        let has_md5_meta = extra_headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("x-amz-meta-md5"));

        let policy = self.settings.retry;
        let attempts = policy.max_retries.max(1);
        let mut attempt = 1;
        loop {
            let sent = body.len() as i64;
            progress(sent);
            match self
                .put_once(url, body.clone(), &checksum, extra_headers, has_md5_meta)
                .await
            {
                Ok(()) => {
                    debug!(url, bytes = sent, "upload complete");
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    progress(-sent);
                    reader.seek(SeekFrom::Start(0))?;
                    body.clear();
                    reader.read_to_end(&mut body)?;

                    let backoff = policy.backoff(attempt);
                    warn!(
                        "upload failed (attempt {}/{}), retrying in {}ms: {}",
                        attempt,
                        attempts,
                        backoff.as_millis(),
                        e
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn put_once(
        &self,
        url: &str,
        body: Vec<u8>,
        checksum: &str,
        extra_headers: &[(String, String)],
        has_md5_meta: bool,
    ) -> BackendResult<()> {
        let mut request = self.client.put(url).header("Content-MD5", checksum);
        for (name, value) in extra_headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.body(body).send().await.map_err(transport_error)?;
        let status = response.status().as_u16();
        if response.status().is_success() {
            return Ok(());
        }

        let message = response.text().await.unwrap_or_default();
        // Storage providers answer slow uploads with a 400 RequestTimeout.
        // It is only safe to resend when the checksum travels with the request.
        if status == 400 && message.contains("RequestTimeout") && has_md5_meta {
            return Err(BackendError::Transient { message });
        }
        Err(BackendError::Http { status, message })
    }

    async fn get_bytes(&self, url: &str) -> BackendResult<Vec<u8>> {
        self.settings
            .retry
            .run("artifact download", move || async move {
                let response = self.client.get(url).send().await.map_err(transport_error)?;
                let status = response.status();
                if !status.is_success() {
                    return Err(BackendError::Http {
                        status: status.as_u16(),
                        message: response.text().await.unwrap_or_default(),
                    });
                }
                let bytes = response.bytes().await.map_err(transport_error)?;
                Ok(bytes.to_vec())
            })
            .await
    }
}

#[async_trait]
impl SweepBackend for GraphqlClient {
    async fn sweep(
        &self,
        entity: &str,
        project: &str,
        sweep_id: &str,
    ) -> BackendResult<Option<SweepRecord>> {
        let data = self
            .execute(
                "query Sweep($entity: String, $project: String!, $name: String!) {
                    project(name: $project, entityName: $entity) {
                        sweep(sweepName: $name) { id name config state }
                    }
                }",
                json!({ "entity": entity, "project": project, "name": sweep_id }),
            )
            .await?;

        match data.pointer("/project/sweep") {
            None | Some(Value::Null) => Ok(None),
            Some(sweep) => Ok(Some(SweepRecord {
                id: string_field(sweep, "/id")?,
                name: string_field(sweep, "/name")?,
                config: sweep
                    .get("config")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                state: sweep
                    .get("state")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            })),
        }
    }

    async fn register_agent(
        &self,
        host: &str,
        sweep_id: &str,
        project: &str,
        entity: &str,
    ) -> BackendResult<AgentConfig> {
        let data = self
            .execute(
                "mutation CreateAgent($host: String!, $projectName: String, $entityName: String, $sweep: String!) {
                    createAgent(input: { host: $host, projectName: $projectName, entityName: $entityName, sweep: $sweep }) {
                        agent { id }
                    }
                }",
                json!({ "host": host, "projectName": project, "entityName": entity, "sweep": sweep_id }),
            )
            .await?;
        Ok(AgentConfig {
            id: string_field(&data, "/createAgent/agent/id")?,
        })
    }

    async fn agent_heartbeat(
        &self,
        agent_id: &str,
        run_states: &BTreeMap<String, bool>,
    ) -> BackendResult<Vec<Value>> {
        let data = self
            .execute(
                "mutation Heartbeat($id: ID!, $metrics: JSONString, $runState: JSONString) {
                    agentHeartbeat(input: { id: $id, metrics: $metrics, runState: $runState }) {
                        agent { id }
                        commands
                    }
                }",
                json!({
                    "id": agent_id,
                    "metrics": "{}",
                    "runState": serde_json::to_string(run_states).map_err(|e| invalid(e.to_string()))?,
                }),
            )
            .await?;

        // Commands arrive as a JSON-encoded string.
        match data.pointer("/agentHeartbeat/commands") {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::String(raw)) if raw.is_empty() => Ok(Vec::new()),
            Some(Value::String(raw)) => {
                serde_json::from_str(raw).map_err(|e| invalid(e.to_string()))
            }
            Some(Value::Array(commands)) => Ok(commands.clone()),
            Some(other) => Err(invalid(format!("unexpected heartbeat commands: {other}"))),
        }
    }

    async fn get_run_state(
        &self,
        entity: &str,
        project: &str,
        run_id: &str,
    ) -> BackendResult<String> {
        let data = self
            .execute(
                "query RunState($entity: String!, $project: String!, $name: String!) {
                    project(name: $project, entityName: $entity) { run(name: $name) { state } }
                }",
                json!({ "entity": entity, "project": project, "name": run_id }),
            )
            .await?;
        match data.pointer("/project/run") {
            None | Some(Value::Null) => Err(BackendError::NotFound(format!("run {run_id}"))),
            Some(run) => string_field(run, "/state"),
        }
    }

    async fn stop_run(&self, run_id: &str) -> BackendResult<bool> {
        let data = self
            .execute(
                "mutation StopRun($id: ID!) { stopRun(input: { id: $id }) { success } }",
                json!({ "id": run_id }),
            )
            .await?;
        Ok(data
            .pointer("/stopRun/success")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    async fn upsert_run(&self, request: UpsertRun) -> BackendResult<RunRecord> {
        let data = self
            .execute(
                "mutation UpsertBucket($project: String, $entity: String, $sweep: String, $config: JSONString) {
                    upsertBucket(input: { modelName: $project, entityName: $entity, sweep: $sweep, config: $config }) {
                        bucket { id name }
                    }
                }",
                json!({
                    "project": request.project,
                    "entity": request.entity,
                    "sweep": request.sweep_name,
                    "config": request.config.to_string(),
                }),
            )
            .await?;
        Ok(RunRecord {
            id: string_field(&data, "/upsertBucket/bucket/id")?,
            name: string_field(&data, "/upsertBucket/bucket/name")?,
        })
    }

    async fn run_metric_history(
        &self,
        entity: &str,
        project: &str,
        run_id: &str,
        metric: &str,
        since: usize,
    ) -> BackendResult<Vec<f64>> {
        let data = self
            .execute(
                "query RunHistory($entity: String!, $project: String!, $name: String!, $keys: [String!]) {
                    project(name: $project, entityName: $entity) {
                        run(name: $name) { sampledHistory(specs: [{ keys: $keys }]) }
                    }
                }",
                json!({ "entity": entity, "project": project, "name": run_id, "keys": [metric] }),
            )
            .await?;

        let rows = data
            .pointer("/project/run/sampledHistory/0")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(rows
            .iter()
            .filter_map(|row| row.get(metric).and_then(Value::as_f64))
            .skip(since)
            .collect())
    }

    async fn job_exists(&self, entity: &str, project: &str, job: &str) -> BackendResult<bool> {
        let name = if job.contains('/') {
            job.to_string()
        } else {
            format!("{entity}/{project}/{job}")
        };
        let data = self
            .execute(
                "query Artifact($name: String!) { artifact(name: $name) { id } }",
                json!({ "name": name }),
            )
            .await?;
        Ok(!matches!(data.pointer("/artifact"), None | Some(Value::Null)))
    }

    async fn log_artifact(
        &self,
        entity: &str,
        project: &str,
        artifact: ArtifactSpec,
    ) -> BackendResult<()> {
        let file_name = artifact
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| invalid(format!("bad artifact path {}", artifact.path.display())))?
            .to_string();
        let mut file = std::fs::File::open(&artifact.path)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        let digest = md5_base64(&contents);

        let data = self
            .execute(
                "mutation CreateArtifact($entity: String!, $project: String!, $type: String!, $name: String!, $digest: String!) {
                    createArtifact(input: {
                        entityName: $entity, projectName: $project, artifactTypeName: $type,
                        artifactCollectionNames: [$name], digest: $digest, digestAlgorithm: MANIFEST_MD5
                    }) { artifact { id } }
                }",
                json!({
                    "entity": entity, "project": project, "type": artifact.kind,
                    "name": artifact.name, "digest": digest,
                }),
            )
            .await?;
        let artifact_id = string_field(&data, "/createArtifact/artifact/id")?;

        let data = self
            .execute(
                "mutation CreateArtifactFiles($artifactID: ID!, $name: String!, $md5: String!) {
                    createArtifactFiles(input: { artifactFiles: [{ artifactID: $artifactID, name: $name, md5: $md5 }] }) {
                        files { edges { node { uploadUrl uploadHeaders } } }
                    }
                }",
                json!({ "artifactID": artifact_id, "name": file_name, "md5": digest }),
            )
            .await?;
        let node = field(&data, "/createArtifactFiles/files/edges/0/node")?;
        let upload_url = string_field(node, "/uploadUrl")?;
        let headers: Vec<(String, String)> = node
            .get("uploadHeaders")
            .and_then(Value::as_array)
            .map(|headers| {
                headers
                    .iter()
                    .filter_map(Value::as_str)
                    .filter_map(|h| h.split_once(':'))
                    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                    .collect()
            })
            .unwrap_or_default();

        self.upload_file(&upload_url, &mut file, &headers, &mut |_: i64| {})
            .await?;

        self.execute(
            "mutation CommitArtifact($artifactID: ID!) { commitArtifact(input: { artifactID: $artifactID }) { artifact { id } } }",
            json!({ "artifactID": artifact_id }),
        )
        .await?;
        info!(artifact = %artifact.name, kind = %artifact.kind, "logged artifact");
        Ok(())
    }

    async fn download_artifact(
        &self,
        entity: &str,
        project: &str,
        name: &str,
        dest: &Path,
    ) -> BackendResult<PathBuf> {
        let qualified = if name.contains(':') {
            name.to_string()
        } else {
            format!("{name}:latest")
        };
        let data = self
            .execute(
                "query ArtifactFiles($entity: String!, $project: String!, $name: String!) {
                    project(name: $project, entityName: $entity) {
                        artifact(name: $name) { files { edges { node { name directUrl } } } }
                    }
                }",
                json!({ "entity": entity, "project": project, "name": qualified }),
            )
            .await?;
        let edges = match data.pointer("/project/artifact") {
            None | Some(Value::Null) => {
                return Err(BackendError::NotFound(format!("artifact {qualified}")))
            }
            Some(artifact) => artifact
                .pointer("/files/edges")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
        };

        std::fs::create_dir_all(dest)?;
        for edge in &edges {
            let file_name = string_field(edge, "/node/name")?;
            let url = string_field(edge, "/node/directUrl")?;
            let bytes = self.get_bytes(&url).await?;
            std::fs::write(dest.join(&file_name), bytes)?;
        }
        debug!(artifact = %qualified, files = edges.len(), dest = %dest.display(), "downloaded artifact");
        Ok(dest.to_path_buf())
    }
}

#[async_trait]
impl LaunchQueue for GraphqlClient {
    async fn submit(&self, request: LaunchRequest) -> BackendResult<QueuedRun> {
        let run_spec = json!({
            "run_id": request.run_id,
            "entity": request.entity,
            "project": request.project,
            "job": request.job,
            "docker": { "docker_image": request.image_uri },
            "entry_point": request.entry_point,
            "overrides": {
                "run_config": request.overrides.run_config,
                "args": request.overrides.args,
            },
        });
        let data = self
            .execute(
                "mutation PushToRunQueueByName($entityName: String!, $projectName: String!, $queueName: String!, $runSpec: JSONString!) {
                    pushToRunQueueByName(entityName: $entityName, projectName: $projectName, queueName: $queueName, runSpec: $runSpec) {
                        runQueueItemId
                    }
                }",
                json!({
                    "entityName": request.entity,
                    "projectName": request.project_queue,
                    "queueName": request.queue,
                    "runSpec": run_spec.to_string(),
                }),
            )
            .await?;

        Ok(QueuedRun {
            id: string_field(&data, "/pushToRunQueueByName/runQueueItemId")?,
            entity: request.entity,
            project_queue: request.project_queue,
            queue: request.queue,
            run_id: request.run_id,
        })
    }

    async fn status(&self, queued: &QueuedRun) -> BackendResult<QueuedRunStatus> {
        let data = self
            .execute(
                "query RunQueueItem($entity: String!, $project: String!, $queue: String!, $id: ID!) {
                    project(name: $project, entityName: $entity) {
                        runQueue(name: $queue) { runQueueItem(id: $id) { state } }
                    }
                }",
                json!({
                    "entity": queued.entity,
                    "project": queued.project_queue,
                    "queue": queued.queue,
                    "id": queued.id,
                }),
            )
            .await?;
        let state = string_field(&data, "/project/runQueue/runQueueItem/state")?;
        Ok(QueuedRunStatus::from_remote(&state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io::Cursor;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                let length = head
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Answer one connection per canned response and record each request.
    async fn serve(responses: Vec<(u16, &'static str)>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();

        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let request = read_request(&mut socket).await;
                seen.lock().push(request);
                let reply = format!(
                    "HTTP/1.1 {status} Canned\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{addr}"), requests)
    }

    fn client(base_url: &str) -> GraphqlClient {
        GraphqlClient::new(BackendSettings {
            base_url: base_url.to_string(),
            api_key: Some("secret".into()),
            timeout: Duration::from_secs(5),
            retry: RetryPolicy::immediate(3),
        })
        .unwrap()
    }

    #[test]
    fn md5_header_value() {
        assert_eq!(md5_base64(b"hello world"), "XrY7u+Ae7tCTyyK7j1rNww==");
    }

    #[tokio::test]
    async fn upload_retries_server_errors_and_rewinds() {
        let (base, requests) = serve(vec![(500, "boom"), (200, "")]).await;
        let client = client(&base);
        let mut reader = Cursor::new(b"hello world".to_vec());
        let mut events = Vec::new();

        client
            .upload_file(&format!("{base}/upload"), &mut reader, &[], &mut |n: i64| events.push(n))
            .await
            .unwrap();

        assert_eq!(events, vec![11, -11, 11]);
        let requests = requests.lock();
        assert_eq!(requests.len(), 2);
        for request in requests.iter() {
            let lower = request.to_lowercase();
            assert!(lower.contains("content-md5: xry7u+ae7tctyyk7j1rnww=="), "{request}");
            assert!(request.ends_with("hello world"));
        }
    }

    #[tokio::test]
    async fn upload_surfaces_client_errors_without_retry() {
        let (base, requests) = serve(vec![(403, "denied")]).await;
        let client = client(&base);
        let mut reader = Cursor::new(b"data".to_vec());

        let err = client
            .upload_file(&format!("{base}/upload"), &mut reader, &[], &mut |_: i64| {})
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Http { status: 403, .. }));
        assert_eq!(requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn request_timeout_needs_md5_metadata_to_retry() {
        let (base, requests) = serve(vec![(400, "<Code>RequestTimeout</Code>")]).await;
        let client = client(&base);
        let mut reader = Cursor::new(b"data".to_vec());
        let err = client
            .upload_file(&format!("{base}/upload"), &mut reader, &[], &mut |_: i64| {})
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Http { status: 400, .. }));
        assert_eq!(requests.lock().len(), 1);

        let (base, requests) =
            serve(vec![(400, "<Code>RequestTimeout</Code>"), (200, "")]).await;
        let client = self::client(&base);
        let headers = vec![("x-amz-meta-md5".to_string(), md5_base64(b"data"))];
        client
            .upload_file(&format!("{base}/upload"), &mut reader, &headers, &mut |_: i64| {})
            .await
            .unwrap();
        assert_eq!(requests.lock().len(), 2);
    }

    #[tokio::test]
    async fn graphql_retries_gateway_errors() {
        let (base, requests) = serve(vec![
            (502, "bad gateway"),
            (200, r#"{"data": {"project": {"sweep": null}}}"#),
        ])
        .await;
        let client = client(&base);

        let sweep = client.sweep("entity", "project", "missing").await.unwrap();
        assert!(sweep.is_none());
        let requests = requests.lock();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].starts_with("POST /graphql"));
    }

    #[tokio::test]
    async fn heartbeat_decodes_command_string() {
        let (base, _) = serve(vec![(
            200,
            r#"{"data": {"agentHeartbeat": {"agent": {"id": "a"}, "commands": "[{\"type\": \"run\", \"run_id\": \"r1\"}]"}}}"#,
        )])
        .await;
        let client = client(&base);

        let commands = client.agent_heartbeat("a", &BTreeMap::new()).await.unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0]["run_id"], "r1");
    }

    #[tokio::test]
    async fn graphql_errors_are_invalid_responses() {
        let (base, requests) =
            serve(vec![(200, r#"{"errors": [{"message": "permission denied"}]}"#)]).await;
        let client = client(&base);

        let err = client.stop_run("r1").await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidResponse { ref message } if message == "permission denied"));
        assert_eq!(requests.lock().len(), 1);
    }
}

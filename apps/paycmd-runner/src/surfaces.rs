//! File and HTTP implementations of the orchestrator's outside-facing seams.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use paycmd_core::{AuditSink, CapabilityError, CommandSource, HttpResponse, PendingCommand, ToolTransport};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Command lines read from a text file, one command per line.
///
/// Consumed lines are recorded as `<line>\t<label>` in a sidecar file next to the command file,
/// so a restart does not replay them.
pub struct FileCommandSource {
    path: PathBuf,
    consumed_path: PathBuf,
    consumed: Mutex<Option<BTreeSet<usize>>>,
}

impl FileCommandSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut consumed_path = path.clone().into_os_string();
        consumed_path.push(".consumed");
        Self {
            path,
            consumed_path: PathBuf::from(consumed_path),
            consumed: Mutex::new(None),
        }
    }

    async fn load_consumed(&self) -> Result<BTreeSet<usize>, CapabilityError> {
        let raw = match tokio::fs::read_to_string(&self.consumed_path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(error) => return Err(io_error(&self.consumed_path, &error)),
        };
        Ok(raw
            .lines()
            .filter_map(|line| line.split('\t').next())
            .filter_map(|index| index.trim().parse::<usize>().ok())
            .collect())
    }
}

#[async_trait]
impl CommandSource for FileCommandSource {
    async fn list_pending(&self, _scope: &str) -> Result<Vec<PendingCommand>, CapabilityError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(io_error(&self.path, &error)),
        };

        let mut consumed = self.consumed.lock().await;
        if consumed.is_none() {
            *consumed = Some(self.load_consumed().await?);
        }
        let seen = consumed.clone().unwrap_or_default();

        Ok(raw
            .lines()
            .enumerate()
            .filter(|(index, line)| !line.trim().is_empty() && !seen.contains(index))
            .map(|(index, line)| PendingCommand {
                text: line.to_string(),
                position_ref: index.to_string(),
            })
            .collect())
    }

    async fn mark_consumed(
        &self,
        position_ref: &str,
        status_label: &str,
    ) -> Result<(), CapabilityError> {
        let index = position_ref
            .parse::<usize>()
            .map_err(|_| CapabilityError::Rejected(format!("invalid line ref {position_ref}")))?;

        let mut consumed = self.consumed.lock().await;
        append_line(&self.consumed_path, &format!("{index}\t{status_label}")).await?;
        consumed.get_or_insert_with(BTreeSet::new).insert(index);
        Ok(())
    }
}

/// Audit lines appended as JSON objects to a single file.
pub struct JsonlAuditSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn append_line(&self, scope: &str, line: &str) -> Result<(), CapabilityError> {
        let record = json!({
            "ts": Utc::now().to_rfc3339(),
            "scope": scope,
            "line": line,
        });
        let _guard = self.write_lock.lock().await;
        append_line(&self.path, &record.to_string()).await
    }
}

async fn append_line(path: &Path, line: &str) -> Result<(), CapabilityError> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|error| io_error(path, &error))?;
    file.write_all(format!("{line}\n").as_bytes())
        .await
        .map_err(|error| io_error(path, &error))?;
    file.flush().await.map_err(|error| io_error(path, &error))
}

fn io_error(path: &Path, error: &std::io::Error) -> CapabilityError {
    CapabilityError::Unavailable(format!("{}: {error}", path.display()))
}

/// JSON-over-HTTP transport for paid tools.
pub struct HttpToolTransport {
    client: reqwest::Client,
}

impl HttpToolTransport {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(TOOL_TIMEOUT).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ToolTransport for HttpToolTransport {
    async fn post(
        &self,
        url: &str,
        body: &Value,
        headers: &BTreeMap<String, String>,
    ) -> Result<HttpResponse, CapabilityError> {
        let mut request = self.client.post(url).json(body);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect::<BTreeMap<_, _>>();
        let text = response.text().await.map_err(transport_error)?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or_else(|_| json!({ "text": text }))
        };

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

fn transport_error(error: reqwest::Error) -> CapabilityError {
    if error.is_builder() {
        CapabilityError::Rejected(error.to_string())
    } else {
        CapabilityError::Transport(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use paycmd_core::{AuditSink, CommandSource};

    use super::{FileCommandSource, JsonlAuditSink};

    #[tokio::test]
    async fn file_source_skips_consumed_lines_across_restarts() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("commands.txt");
        std::fs::write(&path, "PAY 1 USDC TO 0x1\n\nPAY 2 USDC TO 0x2\n")?;

        let source = FileCommandSource::new(&path);
        let pending = source.list_pending("ops").await?;
        assert_eq!(pending.len(), 2);
        source.mark_consumed(&pending[0].position_ref, "created").await?;
        assert_eq!(source.list_pending("ops").await?.len(), 1);

        let restarted = FileCommandSource::new(&path);
        let pending = restarted.list_pending("ops").await?;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].text, "PAY 2 USDC TO 0x2");
        Ok(())
    }

    #[tokio::test]
    async fn audit_sink_appends_json_lines() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("audit.jsonl");
        let sink = JsonlAuditSink::new(&path);
        sink.append_line("ops", "DONE cmd_1 0xabc").await?;
        sink.append_line("ops", "ABORTED cmd_2 OPERATOR_ABORT: stop").await?;

        let raw = std::fs::read_to_string(&path)?;
        let lines = raw.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0])?;
        assert_eq!(first["scope"], "ops");
        assert_eq!(first["line"], "DONE cmd_1 0xabc");
        Ok(())
    }
}

//! Minimal QMP client over a UNIX stream socket.
//!
//! The emulator control channel speaks line-delimited JSON: a greeting on
//! connect, a `qmp_capabilities` negotiation, then one response object per
//! executed command. Asynchronous `event` objects may arrive interleaved
//! and are skipped. Connections are short-lived: one per control operation.

use std::fmt;
use std::path::Path;

use log::{error, trace};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

#[derive(Debug)]
pub enum QmpError {
    Io(std::io::Error),
    /// The peer sent something that is not QMP.
    Protocol(String),
    /// The command was rejected by the emulator.
    Command { class: String, desc: String },
}

impl fmt::Display for QmpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QmpError::Io(e) => write!(f, "IO error: {e}"),
            QmpError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            QmpError::Command { class, desc } => write!(f, "command failed ({class}): {desc}"),
        }
    }
}

impl std::error::Error for QmpError {}

impl From<std::io::Error> for QmpError {
    fn from(error: std::io::Error) -> Self {
        QmpError::Io(error)
    }
}

impl From<serde_json::Error> for QmpError {
    fn from(error: serde_json::Error) -> Self {
        QmpError::Protocol(error.to_string())
    }
}

/// What one received line means to a pending `execute`.
#[derive(Debug, PartialEq)]
enum Response {
    /// Asynchronous event, not addressed to us.
    Event,
    /// Command result payload.
    Return(Value),
}

/// Classifies one line of the response stream.
fn classify(line: &str) -> Result<Response, QmpError> {
    let value: Value = serde_json::from_str(line)?;
    if value.get("event").is_some() {
        return Ok(Response::Event);
    }
    if let Some(ret) = value.get("return") {
        return Ok(Response::Return(ret.clone()));
    }
    if let Some(err) = value.get("error") {
        let class = err
            .get("class")
            .and_then(Value::as_str)
            .unwrap_or("GenericError")
            .to_string();
        let desc = err
            .get("desc")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        return Err(QmpError::Command { class, desc });
    }
    Err(QmpError::Protocol(format!("unexpected response: {line}")))
}

/// One connected, capabilities-negotiated control channel.
pub struct QmpClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl QmpClient {
    /// Connects, consumes the greeting and negotiates capabilities.
    pub async fn connect<P: AsRef<Path>>(socket_path: P) -> Result<Self, QmpError> {
        let stream = UnixStream::connect(socket_path.as_ref()).await?;
        let (read_half, write_half) = stream.into_split();
        let mut client = QmpClient {
            reader: BufReader::new(read_half),
            writer: write_half,
        };

        let greeting = client.read_line().await?;
        let value: Value = serde_json::from_str(&greeting)?;
        if value.get("QMP").is_none() {
            return Err(QmpError::Protocol(format!("no greeting: {greeting}")));
        }

        client.execute("qmp_capabilities", None).await?;
        Ok(client)
    }

    /// Runs one command and returns its `return` payload.
    pub async fn execute(
        &mut self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<Value, QmpError> {
        let request = match arguments {
            Some(args) => json!({"execute": command, "arguments": args}),
            None => json!({"execute": command}),
        };
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;

        loop {
            let line = self.read_line().await?;
            match classify(&line)? {
                Response::Event => {
                    trace!("skipping QMP event: {line}");
                }
                Response::Return(value) => return Ok(value),
            }
        }
    }

    async fn read_line(&mut self) -> Result<String, QmpError> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(QmpError::Protocol("connection closed".to_string()));
        }
        Ok(line)
    }
}

/// Fire-and-forget convenience used by the VM controller: connect, run one
/// command, log failures and map the outcome to a bool.
pub async fn execute_once<P: AsRef<Path>>(
    socket_path: P,
    command: &str,
    arguments: Option<Value>,
) -> bool {
    match QmpClient::connect(&socket_path).await {
        Ok(mut client) => match client.execute(command, arguments).await {
            Ok(_) => true,
            Err(e) => {
                error!("{command} failed: {e}");
                false
            }
        },
        Err(e) => {
            error!("connecting control channel for {command} failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_skips_events() {
        let line = r#"{"event": "JOB_STATUS_CHANGE", "data": {"status": "created"}}"#;
        assert_eq!(classify(line).unwrap(), Response::Event);
    }

    #[test]
    fn classify_extracts_return_payload() {
        let line = r#"{"return": [{"device": "snapshot0", "inserted": {"node-name": "node0"}}]}"#;
        match classify(line).unwrap() {
            Response::Return(value) => {
                assert_eq!(value[0]["device"], "snapshot0");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn classify_maps_errors() {
        let line = r#"{"error": {"class": "GenericError", "desc": "tag not found"}}"#;
        match classify(line).unwrap_err() {
            QmpError::Command { class, desc } => {
                assert_eq!(class, "GenericError");
                assert_eq!(desc, "tag not found");
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn classify_rejects_garbage() {
        assert!(matches!(classify("not json"), Err(QmpError::Protocol(_))));
        assert!(matches!(
            classify(r#"{"neither": 1}"#),
            Err(QmpError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn full_round_trip_against_a_fake_server() {
        use tokio::io::AsyncReadExt;

        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("qmp.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream
                .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
                .await
                .unwrap();

            let mut buf = vec![0u8; 4096];
            // capabilities negotiation
            let n = stream.read(&mut buf).await.unwrap();
            assert!(String::from_utf8_lossy(&buf[..n]).contains("qmp_capabilities"));
            stream.write_all(b"{\"return\": {}}\n").await.unwrap();

            // one command, with an interleaved event before the result
            let n = stream.read(&mut buf).await.unwrap();
            let request: Value = serde_json::from_slice(&buf[..n]).unwrap();
            assert_eq!(request["execute"], "stop");
            stream
                .write_all(b"{\"event\": \"STOP\", \"data\": {}}\n{\"return\": {}}\n")
                .await
                .unwrap();
        });

        let mut client = QmpClient::connect(&socket).await.unwrap();
        let result = client.execute("stop", None).await.unwrap();
        assert_eq!(result, serde_json::json!({}));
        server.await.unwrap();
    }
}

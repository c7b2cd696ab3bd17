//! Client side of the Almanac socket

use almanac_core::{
    ChangeEvent, DaemonStatus, ResponseData, SettingsRequest, SettingsResponse, Value,
};
use anyhow::{anyhow, bail, Result};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::UnixStream;

pub struct SettingsClient {
    socket_path: String,
}

impl SettingsClient {
    pub fn new(socket_path: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub async fn send(&self, request: SettingsRequest) -> Result<SettingsResponse> {
        let mut stream = UnixStream::connect(&self.socket_path).await?;

        let request_json = serde_json::to_string(&request)?;
        stream.write_all(request_json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;

        Ok(serde_json::from_str(&line)?)
    }

    /// Send and unwrap a success payload
    pub async fn request(&self, request: SettingsRequest) -> Result<ResponseData> {
        match self.send(request).await? {
            SettingsResponse::Success { data } => Ok(data),
            SettingsResponse::Error { code, message } => Err(anyhow!("{} (code {})", message, code)),
            SettingsResponse::Event { .. } => bail!("Unexpected event"),
        }
    }

    pub async fn get_value(&self, path: &str) -> Result<Value> {
        match self.request(SettingsRequest::GetValue { path: path.to_string() }).await? {
            ResponseData::Value(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    /// Every value under a group, keyed by relative path
    pub async fn get_values(&self, path: &str) -> Result<BTreeMap<String, Value>> {
        match self.request(SettingsRequest::GetValue { path: path.to_string() }).await? {
            ResponseData::Values(values) => Ok(values),
            ResponseData::Value(value) => Ok(BTreeMap::from([(String::new(), value)])),
            other => Err(unexpected(other)),
        }
    }

    /// Whether the daemon accepted the value
    pub async fn set_value(&self, path: &str, value: Value) -> Result<bool> {
        match self
            .request(SettingsRequest::SetValue {
                path: path.to_string(),
                value,
            })
            .await?
        {
            ResponseData::WriteStatus(status) => Ok(status == 0),
            other => Err(unexpected(other)),
        }
    }

    pub async fn add_setting(
        &self,
        group: &str,
        name: &str,
        default: JsonValue,
        item_type: &str,
        min: Option<JsonValue>,
        max: Option<JsonValue>,
    ) -> Result<Value> {
        match self
            .request(SettingsRequest::AddSetting {
                group: group.to_string(),
                name: name.to_string(),
                default,
                item_type: item_type.to_string(),
                min,
                max,
            })
            .await?
        {
            ResponseData::Value(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_status(&self) -> Result<DaemonStatus> {
        match self.request(SettingsRequest::GetStatus).await? {
            ResponseData::Status(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    /// Open a connection that streams change events under `prefix`
    pub async fn subscribe(&self, prefix: Option<String>) -> Result<EventStream> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let (reader, mut writer) = stream.into_split();

        let request_json = serde_json::to_string(&SettingsRequest::Subscribe { prefix })?;
        writer.write_all(request_json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        let mut lines = BufReader::new(reader).lines();
        let line = lines
            .next_line()
            .await?
            .ok_or_else(|| anyhow!("Connection closed"))?;
        match serde_json::from_str::<SettingsResponse>(&line)? {
            SettingsResponse::Success {
                data: ResponseData::Subscribed { .. },
            } => Ok(EventStream {
                lines,
                _writer: writer,
            }),
            SettingsResponse::Error { message, .. } => Err(anyhow!(message)),
            other => Err(anyhow!("Unexpected response: {:?}", other)),
        }
    }
}

/// Change events of a subscribed connection
pub struct EventStream {
    lines: Lines<BufReader<OwnedReadHalf>>,
    // Dropping the write half would shut the connection down
    _writer: tokio::net::unix::OwnedWriteHalf,
}

impl EventStream {
    /// Next event, or `None` when the daemon closes the connection
    pub async fn next_event(&mut self) -> Result<Option<ChangeEvent>> {
        while let Some(line) = self.lines.next_line().await? {
            if let SettingsResponse::Event { event } = serde_json::from_str::<SettingsResponse>(&line)? {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }
}

fn unexpected(data: ResponseData) -> anyhow::Error {
    anyhow!("Unexpected response: {:?}", data)
}

//! IPC interface for Almanac
//!
//! `dispatch` maps one request onto the registry. `IpcServer` accepts
//! JSON-lines connections and forwards their requests to the service task;
//! a connection that subscribes also receives matching change events.

use crate::service::ServiceHandle;
use almanac_core::{
    definition_from_json, resolve_relative, AddOptions, ChangeEvent, Registry, ResponseData,
    SetError, SettingsRequest, SettingsResponse, STATUS_FAILED,
};
use anyhow::Result;
use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

/// Run one request against the registry
pub fn dispatch(registry: &mut Registry, request: SettingsRequest) -> SettingsResponse {
    match request {
        SettingsRequest::GetValue { path } => {
            if let Some(setting) = registry.get(&path) {
                return SettingsResponse::success(ResponseData::Value(setting.value().clone()));
            }
            if registry.tree().get_group(&path).is_some() {
                let values = registry
                    .tree()
                    .for_all_settings(&path, |s| Some(s.value().clone()));
                return SettingsResponse::success(ResponseData::Values(values));
            }
            not_found(&path)
        }

        SettingsRequest::GetText { path } => {
            if let Some(setting) = registry.get(&path) {
                return SettingsResponse::success(ResponseData::Text(setting.text()));
            }
            if registry.tree().get_group(&path).is_some() {
                let texts = registry.tree().for_all_settings(&path, |s| Some(s.text()));
                return SettingsResponse::success(ResponseData::Texts(texts));
            }
            not_found(&path)
        }

        SettingsRequest::SetValue { path, value } => {
            write_status(&path, registry.set_value(&path, &value))
        }

        SettingsRequest::GetMin { path } => {
            attribute(registry, &path, |s| ResponseData::Attribute(s.min().cloned()))
        }

        SettingsRequest::GetMax { path } => {
            attribute(registry, &path, |s| ResponseData::Attribute(s.max().cloned()))
        }

        SettingsRequest::GetDefault { path } => attribute(registry, &path, |s| {
            ResponseData::Attribute(s.default_value().cloned())
        }),

        SettingsRequest::SetDefault { path } => {
            if registry.tree().get_group(&path).is_some() {
                let count = registry.set_default_all(&path);
                return SettingsResponse::success(ResponseData::Count(count));
            }
            write_status(&path, registry.set_default(&path))
        }

        SettingsRequest::GetSilent { path } => {
            attribute(registry, &path, |s| ResponseData::Silent(s.silent()))
        }

        SettingsRequest::GetAttributes { path } => attribute(registry, &path, |s| {
            ResponseData::Attributes(s.attributes().clone())
        }),

        SettingsRequest::AddSetting {
            group,
            name,
            default,
            item_type,
            min,
            max,
        } => add_setting(registry, &group, &name, &default, &item_type, &min, &max, false),

        SettingsRequest::AddSilentSetting {
            group,
            name,
            default,
            item_type,
            min,
            max,
        } => add_setting(registry, &group, &name, &default, &item_type, &min, &max, true),

        SettingsRequest::AddSettings { group, items } => {
            SettingsResponse::success(ResponseData::AddOutcomes(registry.add_settings(&group, &items)))
        }

        SettingsRequest::RemoveSettings { group, paths } => {
            let statuses = paths
                .iter()
                .map(|path| {
                    if registry.remove_setting(&resolve_relative(&group, path)) {
                        0
                    } else {
                        STATUS_FAILED
                    }
                })
                .collect();
            SettingsResponse::success(ResponseData::RemoveStatuses(statuses))
        }

        SettingsRequest::Subscribe { .. } => {
            SettingsResponse::error(STATUS_FAILED, "Subscriptions need a socket connection")
        }

        SettingsRequest::Flush => match registry.flush() {
            Ok(saved) => SettingsResponse::success(ResponseData::Flushed { saved }),
            Err(e) => SettingsResponse::error(STATUS_FAILED, e.to_string()),
        },

        SettingsRequest::GetStatus => SettingsResponse::success(ResponseData::Status(registry.status())),

        SettingsRequest::Ping => SettingsResponse::success(ResponseData::Pong {
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    }
}

fn not_found(path: &str) -> SettingsResponse {
    SettingsResponse::error(STATUS_FAILED, format!("Setting not found: {}", path))
}

fn attribute(
    registry: &Registry,
    path: &str,
    f: impl FnOnce(&almanac_core::SettingNode) -> ResponseData,
) -> SettingsResponse {
    match registry.get(path) {
        Some(setting) => SettingsResponse::success(f(setting)),
        None => not_found(path),
    }
}

/// Missing paths are errors; refused writes on an existing setting report -1
fn write_status(path: &str, result: std::result::Result<almanac_core::Value, SetError>) -> SettingsResponse {
    match result {
        Ok(_) => SettingsResponse::success(ResponseData::WriteStatus(0)),
        Err(SetError::NotFound(_)) => not_found(path),
        Err(e) => {
            debug!("Write to {} refused: {}", path, e);
            SettingsResponse::success(ResponseData::WriteStatus(STATUS_FAILED))
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn add_setting(
    registry: &mut Registry,
    group: &str,
    name: &str,
    default: &JsonValue,
    item_type: &str,
    min: &Option<JsonValue>,
    max: &Option<JsonValue>,
    silent: bool,
) -> SettingsResponse {
    let path = resolve_relative(group, name);
    let result = definition_from_json(default, item_type, min, max, silent)
        .and_then(|definition| registry.add_setting(&path, &definition, &AddOptions::default()));
    match result {
        Ok(value) => SettingsResponse::success(ResponseData::Value(value)),
        Err(e) => SettingsResponse::error(e.code(), e.to_string()),
    }
}

/// Unix socket server
pub struct IpcServer {
    socket_path: String,
    service: ServiceHandle,
}

impl IpcServer {
    pub fn new(socket_path: impl Into<String>, service: ServiceHandle) -> Self {
        Self {
            socket_path: socket_path.into(),
            service,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let _ = std::fs::remove_file(&self.socket_path);

        if let Some(parent) = std::path::Path::new(&self.socket_path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        tracing::info!("Almanac IPC listening on {}", self.socket_path);

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let service = self.service.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, service).await {
                            tracing::error!("Client error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                }
            }
        }
    }
}

/// Event stream of a subscribed connection
struct Subscription {
    prefix: String,
    rx: broadcast::Receiver<ChangeEvent>,
}

enum Incoming {
    Line(Option<String>),
    Event(Option<ChangeEvent>),
}

async fn handle_client(stream: UnixStream, service: ServiceHandle) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut subscription: Option<Subscription> = None;

    loop {
        let incoming = tokio::select! {
            line = lines.next_line() => Incoming::Line(line?),
            event = next_event(&mut subscription), if subscription.is_some() => Incoming::Event(event),
        };

        match incoming {
            Incoming::Line(None) => break,
            Incoming::Line(Some(line)) => {
                let response = match serde_json::from_str::<SettingsRequest>(&line) {
                    Ok(SettingsRequest::Subscribe { prefix }) => {
                        let prefix = prefix.unwrap_or_else(|| "/".to_string());
                        subscription = Some(Subscription {
                            prefix: prefix.clone(),
                            rx: service.subscribe(),
                        });
                        SettingsResponse::success(ResponseData::Subscribed { prefix })
                    }
                    Ok(request) => service.call(request).await?,
                    Err(e) => SettingsResponse::error(STATUS_FAILED, format!("Invalid request: {}", e)),
                };
                write_response(&mut writer, &response).await?;
            }
            Incoming::Event(Some(event)) => {
                write_response(&mut writer, &SettingsResponse::Event { event }).await?;
            }
            Incoming::Event(None) => subscription = None,
        }
    }

    Ok(())
}

/// Next event under the subscribed prefix; `None` once the service is gone
async fn next_event(subscription: &mut Option<Subscription>) -> Option<ChangeEvent> {
    let subscription = subscription.as_mut()?;
    loop {
        match subscription.rx.recv().await {
            Ok(event) if event.matches_prefix(&subscription.prefix) => return Some(event),
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Subscriber lagged, {} events dropped", skipped);
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

async fn write_response(writer: &mut OwnedWriteHalf, response: &SettingsResponse) -> Result<()> {
    let response_json = serde_json::to_string(response)?;
    writer.write_all(response_json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

//! Single-owner event loop around the registry
//!
//! All requests and the debounced save run on one task, so the tree is
//! never touched concurrently. Connections talk to it through a
//! [`ServiceHandle`].

use crate::ipc::dispatch;
use almanac_core::{ChangeEvent, Registry, SettingsRequest, SettingsResponse};
use anyhow::{anyhow, Result};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Queued request with its reply slot
struct Call {
    request: SettingsRequest,
    reply: oneshot::Sender<SettingsResponse>,
}

/// Cloneable access to the service task
#[derive(Clone)]
pub struct ServiceHandle {
    tx: mpsc::Sender<Call>,
    events: broadcast::Sender<ChangeEvent>,
}

impl ServiceHandle {
    /// Run one request on the service task
    pub async fn call(&self, request: SettingsRequest) -> Result<SettingsResponse> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Call { request, reply })
            .await
            .map_err(|_| anyhow!("Settings service stopped"))?;
        rx.await.map_err(|_| anyhow!("Settings service dropped the request"))
    }

    /// Receive every change event from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }
}

/// Spawn the service task. It runs until every handle is dropped, then
/// flushes any pending save and hands the registry back.
pub fn spawn(registry: Registry) -> (ServiceHandle, JoinHandle<Registry>) {
    let (tx, rx) = mpsc::channel(100);
    let (events, _) = broadcast::channel(256);
    let service = Service {
        registry,
        rx,
        events: events.clone(),
    };
    let task = tokio::spawn(service.run());
    (ServiceHandle { tx, events }, task)
}

struct Service {
    registry: Registry,
    rx: mpsc::Receiver<Call>,
    events: broadcast::Sender<ChangeEvent>,
}

impl Service {
    async fn run(mut self) -> Registry {
        loop {
            let deadline = self.registry.next_save_deadline();
            let sleep_target = deadline
                .map(tokio::time::Instant::from_std)
                .unwrap_or_else(tokio::time::Instant::now);

            tokio::select! {
                call = self.rx.recv() => match call {
                    Some(Call { request, reply }) => {
                        let response = dispatch(&mut self.registry, request);
                        self.publish();
                        if reply.send(response).is_err() {
                            debug!("Caller went away before the reply");
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(sleep_target), if deadline.is_some() => {
                    if let Err(e) = self.registry.poll(Instant::now()) {
                        error!("Failed to save settings: {}", e);
                    }
                    self.publish();
                }
            }
        }

        match self.registry.flush() {
            Ok(true) => info!("Pending settings saved"),
            Ok(false) => {}
            Err(e) => error!("Failed to save settings: {}", e),
        }
        self.publish();
        self.registry
    }

    fn publish(&mut self) {
        for event in self.registry.take_events() {
            // No receivers is not an error
            let _ = self.events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use almanac_core::{RegistryOptions, ResponseData, Value};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;

    fn add_brightness() -> SettingsRequest {
        serde_json::from_value(json!({
            "type": "add_setting",
            "data": {"group": "/Settings/Gui", "name": "Brightness", "default": 80, "item_type": "i", "min": 0, "max": 100}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_requests_and_events() {
        let dir = tempdir().unwrap();
        let registry =
            Registry::open(RegistryOptions::new(dir.path()).with_save_delay(Duration::ZERO)).unwrap();
        let (handle, task) = spawn(registry);
        let mut events = handle.subscribe();

        let response = handle.call(add_brightness()).await.unwrap();
        assert!(matches!(
            response,
            SettingsResponse::Success { data: ResponseData::Value(Value::Integer(80)) }
        ));

        let response = handle
            .call(SettingsRequest::SetValue {
                path: "/Settings/Gui/Brightness".into(),
                value: Value::Integer(42),
            })
            .await
            .unwrap();
        assert!(matches!(
            response,
            SettingsResponse::Success { data: ResponseData::WriteStatus(0) }
        ));

        let mut saw_change = false;
        while let Ok(event) = events.try_recv() {
            if let ChangeEvent::ValueChanged { path, value, .. } = event {
                if path == "/Settings/Gui/Brightness" && value == Value::Integer(42) {
                    saw_change = true;
                }
            }
        }
        assert!(saw_change);

        drop(handle);
        let registry = task.await.unwrap();
        assert_eq!(
            registry.get("/Settings/Gui/Brightness").unwrap().value(),
            &Value::Integer(42)
        );
    }

    #[tokio::test]
    async fn test_debounced_save_fires() {
        let dir = tempdir().unwrap();
        let registry = Registry::open(
            RegistryOptions::new(dir.path()).with_save_delay(Duration::from_millis(50)),
        )
        .unwrap();
        let (handle, task) = spawn(registry);

        handle.call(add_brightness()).await.unwrap();
        let status = handle.call(SettingsRequest::GetStatus).await.unwrap();
        assert!(matches!(
            status,
            SettingsResponse::Success { data: ResponseData::Status(ref s) } if s.save_pending
        ));

        tokio::time::sleep(Duration::from_millis(300)).await;
        let status = handle.call(SettingsRequest::GetStatus).await.unwrap();
        assert!(matches!(
            status,
            SettingsResponse::Success { data: ResponseData::Status(ref s) } if !s.save_pending
        ));

        let content = std::fs::read_to_string(dir.path().join("settings.xml")).unwrap();
        assert!(content.contains("Brightness"));

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_save_flushed_on_shutdown() {
        let dir = tempdir().unwrap();
        let registry = Registry::open(
            RegistryOptions::new(dir.path()).with_save_delay(Duration::from_secs(60)),
        )
        .unwrap();
        let (handle, task) = spawn(registry);

        handle.call(add_brightness()).await.unwrap();
        drop(handle);
        task.await.unwrap();

        let content = std::fs::read_to_string(dir.path().join("settings.xml")).unwrap();
        assert!(content.contains("Brightness"));
    }
}

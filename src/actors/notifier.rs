//! NotifierActor - Forwards alert events to the configured webhook

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, instrument, trace, warn};

use crate::alerts::AlertManager;

use super::messages::{AlertEvent, NotifierCommand, NotifierStats};

/// Actor that delivers alert events
pub struct NotifierActor {
    alert_manager: AlertManager,

    command_rx: mpsc::Receiver<NotifierCommand>,

    /// Alert event receiver (broadcast subscription)
    event_rx: broadcast::Receiver<AlertEvent>,

    muted: bool,

    stats: NotifierStats,
}

impl NotifierActor {
    pub fn new(
        alert_manager: AlertManager,
        command_rx: mpsc::Receiver<NotifierCommand>,
        event_rx: broadcast::Receiver<AlertEvent>,
    ) -> Self {
        Self {
            alert_manager,
            command_rx,
            event_rx,
            muted: false,
            stats: NotifierStats::default(),
        }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting notifier actor");

        loop {
            tokio::select! {
                result = self.event_rx.recv() => {
                    match result {
                        Ok(event) => self.handle_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("notifier lagged, skipped {skipped} alert events");
                            self.stats.lagged += skipped;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("alert channel closed, shutting down");
                            break;
                        }
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        NotifierCommand::Mute => {
                            debug!("muting notifications");
                            self.muted = true;
                        }
                        NotifierCommand::Unmute => {
                            debug!("unmuting notifications");
                            self.muted = false;
                        }
                        NotifierCommand::GetStats { respond_to } => {
                            let _ = respond_to.send(self.stats.clone());
                        }
                        NotifierCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        debug!("notifier actor stopped");
    }

    async fn handle_event(&mut self, event: AlertEvent) {
        if self.muted {
            trace!("muted, dropping alert event");
            self.stats.muted += 1;
            return;
        }

        match self.alert_manager.send_alert(&event).await {
            Ok(()) => self.stats.delivered += 1,
            Err(e) => {
                warn!("failed to deliver alert event: {e:#}");
                self.stats.failed += 1;
            }
        }
    }
}

/// Handle for controlling the NotifierActor
#[derive(Clone)]
pub struct NotifierHandle {
    sender: mpsc::Sender<NotifierCommand>,
}

impl NotifierHandle {
    pub fn spawn(alert_manager: AlertManager, event_rx: broadcast::Receiver<AlertEvent>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let actor = NotifierActor::new(alert_manager, cmd_rx, event_rx);
        tokio::spawn(actor.run());
        Self { sender: cmd_tx }
    }

    pub async fn mute(&self) {
        let _ = self.sender.send(NotifierCommand::Mute).await;
    }

    pub async fn unmute(&self) {
        let _ = self.sender.send(NotifierCommand::Unmute).await;
    }

    pub async fn get_stats(&self) -> Option<NotifierStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(NotifierCommand::GetStats { respond_to: tx })
            .await
            .ok()?;
        rx.await.ok()
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(NotifierCommand::Shutdown).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{Alert, AlertLevel};
    use crate::config::{AlertTarget, Webhook};
    use crate::monitors::resources::ResourceType;
    use chrono::Utc;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_alert() -> Alert {
        Alert {
            id: "cpu-critical-1".to_string(),
            subject: "cpu".to_string(),
            resource_type: ResourceType::Cpu,
            level: AlertLevel::Critical,
            current_value: 92.0,
            threshold: 85.0,
            message: "cpu at 92.0% reached critical threshold 85.0%".to_string(),
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    fn manager_for(server: &MockServer) -> AlertManager {
        AlertManager::new(
            AlertTarget::Webhook(Webhook {
                url: format!("{}/hook", server.uri()),
            }),
            "test-instance",
        )
    }

    async fn wait_for_stats<F>(handle: &NotifierHandle, done: F) -> NotifierStats
    where
        F: Fn(&NotifierStats) -> bool,
    {
        for _ in 0..100 {
            let stats = handle.get_stats().await.unwrap();
            if done(&stats) {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.get_stats().await.unwrap()
    }

    #[tokio::test]
    async fn test_delivers_alert_to_webhook() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (event_tx, event_rx) = broadcast::channel(16);
        let handle = NotifierHandle::spawn(manager_for(&server), event_rx);

        event_tx.send(AlertEvent::Opened(test_alert())).unwrap();

        let stats = wait_for_stats(&handle, |s| s.delivered == 1).await;
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.failed, 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_counts_failed_delivery() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (event_tx, event_rx) = broadcast::channel(16);
        let handle = NotifierHandle::spawn(manager_for(&server), event_rx);

        event_tx.send(AlertEvent::Resolved(test_alert())).unwrap();

        let stats = wait_for_stats(&handle, |s| s.failed == 1).await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.delivered, 0);
    }

    #[tokio::test]
    async fn test_muted_notifier_drops_events() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let (event_tx, event_rx) = broadcast::channel(16);
        let handle = NotifierHandle::spawn(manager_for(&server), event_rx);

        handle.mute().await;
        // round trip so the mute is applied before the event arrives
        handle.get_stats().await.unwrap();
        event_tx.send(AlertEvent::Opened(test_alert())).unwrap();

        let stats = wait_for_stats(&handle, |s| s.muted == 1).await;
        assert_eq!(stats.muted, 1);
        assert_eq!(stats.delivered, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_actor() {
        let server = MockServer::start().await;
        let (_event_tx, event_rx) = broadcast::channel::<AlertEvent>(16);
        let handle = NotifierHandle::spawn(manager_for(&server), event_rx);

        handle.shutdown().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.get_stats().await.is_none());
    }
}

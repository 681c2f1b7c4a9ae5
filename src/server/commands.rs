//! Remote command state machine.
//!
//! Per session the producer is `Idle`, `Streaming` or `Recording` (which
//! implies streaming). Only the controller's stop/record commands change
//! state; the first `START_STREAM` while idle claims the controller slot.
//! Rejected commands still broadcast their notification so every client can
//! resynchronise its view.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::connection::ConnectionId;
use super::fanout::{fan_out, FanOutReport, Payload};
use super::registry::{
    LinkRelease, RecordStart, RecordStop, SessionRegistry, StreamStart, StreamStop,
};
use crate::protocol::{Command, Notification};

pub struct CommandProcessor {
    registry: Arc<SessionRegistry>,
    send_timeout: Duration,
}

impl CommandProcessor {
    pub fn new(registry: Arc<SessionRegistry>, send_timeout: Duration) -> Self {
        Self {
            registry,
            send_timeout,
        }
    }

    /// Parse and apply one inbound text message, then broadcast the resulting
    /// notifications in order. Returns what was broadcast.
    pub async fn handle_text(&self, sender: ConnectionId, text: &str) -> Vec<Notification> {
        let command = match text.parse::<Command>() {
            Ok(command) => command,
            Err(e) => {
                warn!(conn = %sender, error = %e, "Unknown command from client");
                return Vec::new();
            }
        };
        debug!(
            conn = %sender,
            command = %command,
            controller = self.registry.is_controller(sender),
            "Received command"
        );

        let notifications = self.apply(sender, command);
        for notification in &notifications {
            self.notify(*notification).await;
        }
        notifications
    }

    /// Apply a command to the registry. Returns the notifications to emit.
    pub fn apply(&self, sender: ConnectionId, command: Command) -> Vec<Notification> {
        match command {
            Command::StartLink => {
                info!(conn = %sender, "START_LINK handshake, no state change");
                Vec::new()
            }
            Command::StopLink => {
                match self.registry.release_link(sender) {
                    LinkRelease::Released { forced_stop } => {
                        if forced_stop {
                            info!(conn = %sender, "STOP_LINK from controller: forcibly stopped stream/record");
                        }
                        info!(conn = %sender, "Controller released");
                    }
                    LinkRelease::NotController => {
                        debug!(conn = %sender, "STOP_LINK from non-controlling client");
                    }
                }
                Vec::new()
            }
            Command::StartStream => {
                match self.registry.start_stream(sender) {
                    StreamStart::Started { controller_assigned } => {
                        info!(conn = %sender, "Stream started");
                        if controller_assigned {
                            info!(conn = %sender, "Client became controller");
                        }
                    }
                    StreamStart::AlreadyStreaming => {
                        debug!(conn = %sender, "START_STREAM while already streaming");
                    }
                }
                vec![Notification::StreamStarted]
            }
            Command::StopStream => {
                let mut out = Vec::with_capacity(2);
                match self.registry.stop_stream(sender) {
                    StreamStop::Stopped { recording_was_active } => {
                        if recording_was_active {
                            info!(conn = %sender, "Recording stopped with stream");
                            out.push(Notification::RecordStopped);
                        }
                        info!(conn = %sender, "Stream stopped, controller released");
                    }
                    StreamStop::Rejected => {
                        info!(conn = %sender, "STOP_STREAM from non-controlling client or nothing active");
                    }
                }
                out.push(Notification::StreamStopped);
                out
            }
            Command::StartRecord => match self.registry.start_record(sender) {
                RecordStart::Started => {
                    info!(conn = %sender, "Recording started");
                    vec![Notification::RecordStarted]
                }
                RecordStart::NotController => {
                    // Announced even though nothing changed; clients treat it as a hint.
                    info!(conn = %sender, "START_RECORD from non-controlling client, state unchanged");
                    vec![Notification::RecordStarted]
                }
                RecordStart::NotStreaming => {
                    info!(conn = %sender, "START_RECORD but no stream active, rejecting");
                    vec![Notification::RecordStopped]
                }
            },
            Command::StopRecord => {
                match self.registry.stop_record(sender) {
                    RecordStop::Stopped => info!(conn = %sender, "Recording stopped"),
                    RecordStop::Rejected => {
                        info!(conn = %sender, "STOP_RECORD from non-controlling client or not recording")
                    }
                }
                vec![Notification::RecordStopped]
            }
        }
    }

    /// Send a notification to every open connection.
    pub async fn notify(&self, notification: Notification) -> FanOutReport {
        let connections = self.registry.connections();
        let report = fan_out(
            &connections,
            &Payload::Text(notification.as_str().to_string()),
            self.send_timeout,
        )
        .await;
        debug!(
            notification = %notification,
            attempted = report.attempted(),
            failed = report.failed,
            "Notification broadcast"
        );
        report
    }
}

//! Server-wide fan-out of control messages to broadcast listeners

use agentd_protocol::ServerMessage;
use tokio::sync::broadcast;
use tracing::debug;

/// Messages kept for a slow listener before it starts lagging
const BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ControlBus {
    tx: broadcast::Sender<ServerMessage>,
}

impl Default for ControlBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Send to every listener; returns how many received it
    ///
    /// Only `control` and `workflow_control` travel on the bus; anything else
    /// is dropped.
    pub fn publish(&self, msg: ServerMessage) -> usize {
        if !msg.is_broadcast() {
            debug!(?msg, "Refusing to broadcast a session message");
            return 0;
        }
        self.tx.send(msg).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentd_protocol::ControlPayload;

    fn navigate() -> ServerMessage {
        ServerMessage::Control(ControlPayload {
            action: "navigate".to_string(),
            data: None,
            route: Some("/tasks".to_string()),
        })
    }

    #[tokio::test]
    async fn test_publish_reaches_every_listener() {
        let bus = ControlBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        assert_eq!(bus.publish(navigate()), 2);
        assert_eq!(a.recv().await.unwrap(), navigate());
        assert_eq!(b.recv().await.unwrap(), navigate());
    }

    #[test]
    fn test_publish_without_listeners() {
        let bus = ControlBus::new();
        assert_eq!(bus.publish(navigate()), 0);
    }

    #[test]
    fn test_session_messages_stay_off_the_bus() {
        let bus = ControlBus::new();
        let mut rx = bus.subscribe();
        assert_eq!(bus.publish(ServerMessage::Ready), 0);
        assert!(rx.try_recv().is_err());
    }
}

//! Reference service implementation.
//!
//! A minimal control-channel service that conforms to the [`Service`]
//! contract; the heavier services (RTSP streaming) follow the same
//! shape.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::debug;

use super::Service;

/// Descriptor under which the message service registers.
pub const MESSAGE_SERVICE: &str = "MESSAGE_SERVICE";

/// Lightweight message/control service.
pub struct MessageService {
    running: AtomicBool,
    port: u16,
}

impl MessageService {
    pub fn new(port: u16) -> Self {
        Self {
            running: AtomicBool::new(false),
            port,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Default for MessageService {
    fn default() -> Self {
        Self::new(8080)
    }
}

#[async_trait]
impl Service for MessageService {
    async fn start(&self) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return true;
        }
        debug!(port = self.port, "message service started");
        true
    }

    async fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            debug!("message service stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lifecycle_is_idempotent() {
        let service = MessageService::default();
        assert!(!service.is_running());

        assert!(service.start().await);
        assert!(service.start().await);
        assert!(service.is_running());

        service.stop().await;
        service.stop().await;
        assert!(!service.is_running());
    }
}

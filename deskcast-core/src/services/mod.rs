//! Background service registry.
//!
//! A process-wide registry of named services with a start-all /
//! stop-all lifecycle, a single event callback toward the owning
//! controller, and per-service deferred task queues.
//!
//! The registry is an explicit lazily-initialized global
//! ([`service_manager`]); services are registered with explicit
//! [`ServiceManager::register`] calls at startup rather than
//! static-initializer magic.

mod message;
mod task_queue;

pub use message::{MessageService, MESSAGE_SERVICE};
pub use task_queue::TaskQueue;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use tracing::{debug, error};

// ── Service contract ─────────────────────────────────────────────

/// A long-lived background component.
///
/// `start` must be non-blocking (spawn workers, return quickly) and
/// idempotent; `stop` must be idempotent and release every resource.
#[async_trait]
pub trait Service: Send + Sync {
    async fn start(&self) -> bool;
    async fn stop(&self);
    fn is_running(&self) -> bool;
}

// ── Event bus ────────────────────────────────────────────────────

/// Who emitted a [`ServiceMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Main,
    Rtsp,
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEvent {
    Unknown,
    Connect,
    Disconnect,
    StreamRequest,
}

/// One notification from a service to the owning controller.
#[derive(Debug, Clone)]
pub struct ServiceMessage {
    pub sender: ServiceKind,
    pub event: ServiceEvent,
    pub data: String,
}

/// The single event sink installed by the controller.
pub type ServiceEventHandler = Arc<dyn Fn(&ServiceMessage) + Send + Sync>;

// ── Registry ─────────────────────────────────────────────────────

type ServiceCreator = Box<dyn Fn() -> Arc<dyn Service> + Send + Sync>;

struct ServiceEntry {
    creator: ServiceCreator,
    instance: Option<Arc<dyn Service>>,
    is_running: bool,
    tasks: Option<Arc<TaskQueue>>,
}

/// Registry snapshot for one service.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub descriptor: String,
    pub is_running: bool,
    pub has_instance: bool,
}

/// Process-wide service registry. Obtain via [`service_manager`].
pub struct ServiceManager {
    services: Mutex<HashMap<String, ServiceEntry>>,
    event_callback: Mutex<Option<ServiceEventHandler>>,
}

static MANAGER: Lazy<ServiceManager> = Lazy::new(|| ServiceManager {
    services: Mutex::new(HashMap::new()),
    event_callback: Mutex::new(None),
});

/// The process-wide registry.
pub fn service_manager() -> &'static ServiceManager {
    &MANAGER
}

impl ServiceManager {
    /// Register a service type under `descriptor`. Instances are
    /// created lazily on first start. Duplicate descriptors are
    /// rejected.
    pub fn register<T>(&self, descriptor: impl Into<String>) -> bool
    where
        T: Service + Default + 'static,
    {
        let descriptor = descriptor.into();
        let mut services = self.services.lock().expect("registry poisoned");
        if services.contains_key(&descriptor) {
            return false;
        }

        debug!(service = %descriptor, "service registered");
        services.insert(
            descriptor,
            ServiceEntry {
                creator: Box::new(|| Arc::new(T::default())),
                instance: None,
                is_running: false,
                tasks: None,
            },
        );
        true
    }

    /// Stop and drop the service registered under `descriptor`.
    pub async fn unregister(&self, descriptor: &str) {
        let (instance, tasks) = {
            let mut services = self.services.lock().expect("registry poisoned");
            match services.remove(descriptor) {
                Some(entry) => (
                    entry.is_running.then_some(entry.instance).flatten(),
                    entry.tasks,
                ),
                None => (None, None),
            }
        };

        if let Some(instance) = instance {
            instance.stop().await;
        }
        if let Some(tasks) = tasks {
            tasks.shutdown();
        }
    }

    /// Start one service, creating the instance on first use.
    pub async fn start_service(&self, descriptor: &str) -> bool {
        let instance = {
            let mut services = self.services.lock().expect("registry poisoned");
            let Some(entry) = services.get_mut(descriptor) else {
                error!(service = %descriptor, "service not found");
                return false;
            };
            if entry.is_running {
                return true;
            }
            entry
                .instance
                .get_or_insert_with(|| (entry.creator)())
                .clone()
        };

        let started = instance.start().await;
        if started {
            if let Some(entry) = self
                .services
                .lock()
                .expect("registry poisoned")
                .get_mut(descriptor)
            {
                entry.is_running = true;
            }
            debug!(service = %descriptor, "service started");
        } else {
            error!(service = %descriptor, "service failed to start");
        }
        started
    }

    /// Stop one service if it is running.
    pub async fn stop_service(&self, descriptor: &str) {
        let instance = {
            let mut services = self.services.lock().expect("registry poisoned");
            let Some(entry) = services.get_mut(descriptor) else {
                return;
            };
            if !entry.is_running {
                return;
            }
            entry.is_running = false;
            entry.instance.clone()
        };

        if let Some(instance) = instance {
            instance.stop().await;
            debug!(service = %descriptor, "service stopped");
        }
    }

    /// Start every registered service. Returns `false` if any failed.
    pub async fn start_all(&self) -> bool {
        let descriptors = self.get_all_services();
        let mut all_started = true;
        for descriptor in descriptors {
            if !self.start_service(&descriptor).await {
                all_started = false;
            }
        }
        all_started
    }

    /// Stop every running service.
    pub async fn stop_all(&self) {
        for descriptor in self.get_all_services() {
            self.stop_service(&descriptor).await;
        }
    }

    pub fn is_service_running(&self, descriptor: &str) -> bool {
        self.services
            .lock()
            .expect("registry poisoned")
            .get(descriptor)
            .map(|entry| entry.is_running)
            .unwrap_or(false)
    }

    /// Registered descriptors.
    pub fn get_all_services(&self) -> Vec<String> {
        self.services
            .lock()
            .expect("registry poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn get_service_count(&self) -> usize {
        self.services.lock().expect("registry poisoned").len()
    }

    /// Snapshot of one registry entry.
    pub fn get_service_info(&self, descriptor: &str) -> Option<ServiceInfo> {
        self.services
            .lock()
            .expect("registry poisoned")
            .get(descriptor)
            .map(|entry| ServiceInfo {
                descriptor: descriptor.to_string(),
                is_running: entry.is_running,
                has_instance: entry.instance.is_some(),
            })
    }

    /// Install the single event sink for service notifications.
    pub fn set_event_callback(&self, callback: ServiceEventHandler) {
        *self.event_callback.lock().expect("callback poisoned") = Some(callback);
        debug!("service event callback registered");
    }

    /// Publish a message toward the controller.
    ///
    /// The callback runs on `descriptor`'s task queue (created on
    /// first use), never on the caller's thread. Must be called within
    /// a tokio runtime.
    pub fn notify_main_service(&self, descriptor: &str, message: ServiceMessage) {
        let queue = {
            let mut services = self.services.lock().expect("registry poisoned");
            let Some(entry) = services.get_mut(descriptor) else {
                return;
            };
            entry
                .tasks
                .get_or_insert_with(|| Arc::new(TaskQueue::new(descriptor.to_string())))
                .clone()
        };

        let callback = self.event_callback.lock().expect("callback poisoned").clone();
        if let Some(callback) = callback {
            queue.enqueue_task(move || callback(&message), 0);
        }
    }

    /// Schedule a deferred closure on `descriptor`'s task queue.
    pub fn enqueue_task<F>(&self, descriptor: &str, f: F, delay_us: u64) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let queue = {
            let mut services = self.services.lock().expect("registry poisoned");
            let Some(entry) = services.get_mut(descriptor) else {
                return false;
            };
            entry
                .tasks
                .get_or_insert_with(|| Arc::new(TaskQueue::new(descriptor.to_string())))
                .clone()
        };
        queue.enqueue_task(f, delay_us)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct DummyService {
        running: AtomicBool,
    }

    #[async_trait]
    impl Service for DummyService {
        async fn start(&self) -> bool {
            self.running.store(true, Ordering::SeqCst);
            true
        }

        async fn stop(&self) {
            self.running.store(false, Ordering::SeqCst);
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct FailingService;

    #[async_trait]
    impl Service for FailingService {
        async fn start(&self) -> bool {
            false
        }
        async fn stop(&self) {}
        fn is_running(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn register_start_stop_cycle() {
        let manager = service_manager();
        assert!(manager.register::<DummyService>("test.dummy.cycle"));
        assert!(!manager.register::<DummyService>("test.dummy.cycle"), "duplicate rejected");

        assert!(manager.start_service("test.dummy.cycle").await);
        assert!(manager.is_service_running("test.dummy.cycle"));
        // Starting again is a no-op.
        assert!(manager.start_service("test.dummy.cycle").await);

        manager.stop_service("test.dummy.cycle").await;
        assert!(!manager.is_service_running("test.dummy.cycle"));

        manager.unregister("test.dummy.cycle").await;
        assert!(manager.get_service_info("test.dummy.cycle").is_none());
    }

    #[tokio::test]
    async fn unknown_service_operations() {
        let manager = service_manager();
        assert!(!manager.start_service("test.missing").await);
        assert!(!manager.is_service_running("test.missing"));
        manager.stop_service("test.missing").await;
        assert!(manager.get_service_info("test.missing").is_none());
    }

    #[tokio::test]
    async fn failing_service_reports_false() {
        let manager = service_manager();
        manager.register::<FailingService>("test.failing");
        assert!(!manager.start_service("test.failing").await);
        assert!(!manager.is_service_running("test.failing"));
        manager.unregister("test.failing").await;
    }

    #[tokio::test]
    async fn info_reflects_lazy_instantiation() {
        let manager = service_manager();
        manager.register::<DummyService>("test.dummy.lazy");

        let info = manager.get_service_info("test.dummy.lazy").unwrap();
        assert!(!info.has_instance, "instance is created on first start");

        manager.start_service("test.dummy.lazy").await;
        let info = manager.get_service_info("test.dummy.lazy").unwrap();
        assert!(info.has_instance);
        assert!(info.is_running);

        manager.unregister("test.dummy.lazy").await;
    }

    #[tokio::test]
    async fn notifications_reach_the_callback_off_thread() {
        let manager = service_manager();
        manager.register::<DummyService>("test.dummy.notify");

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        manager.set_event_callback(Arc::new(move |message: &ServiceMessage| {
            let _ = tx.send((message.sender, message.event, message.data.clone()));
        }));

        manager.notify_main_service(
            "test.dummy.notify",
            ServiceMessage {
                sender: ServiceKind::Rtsp,
                event: ServiceEvent::Connect,
                data: "peer".into(),
            },
        );

        let (sender, event, data) =
            tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
                .await
                .expect("timeout")
                .expect("channel closed");
        assert_eq!(sender, ServiceKind::Rtsp);
        assert_eq!(event, ServiceEvent::Connect);
        assert_eq!(data, "peer");

        manager.unregister("test.dummy.notify").await;
    }

    #[tokio::test]
    async fn deferred_tasks_run() {
        let manager = service_manager();
        manager.register::<DummyService>("test.dummy.tasks");

        let flag = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&flag);
        assert!(manager.enqueue_task(
            "test.dummy.tasks",
            move || f.store(true, Ordering::SeqCst),
            1_000,
        ));

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(flag.load(Ordering::SeqCst));

        manager.unregister("test.dummy.tasks").await;
    }
}

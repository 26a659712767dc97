//! Debugger and virtual-machine detection.
//!
//! [`AntiTamperMonitor`] polls a [`TamperProbe`] on an interval and hands
//! anything it finds to a [`TamperHandler`]. The handler (the engine) decides
//! what a detection means; for a debugger that is an emergency wipe.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// What to do after wiping because a debugger was seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TamperResponse {
    /// Wipe the key and keep running.
    WipeOnly,
    /// Wipe the key and terminate the process.
    #[default]
    WipeAndExit,
}

/// A single detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TamperIndicator {
    Debugger(String),
    VirtualMachine(String),
}

impl std::fmt::Display for TamperIndicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TamperIndicator::Debugger(detail) => write!(f, "debugger attached ({})", detail),
            TamperIndicator::VirtualMachine(detail) => write!(f, "virtual machine ({})", detail),
        }
    }
}

/// Source of tamper signals.
#[async_trait]
pub trait TamperProbe: Send + Sync + Debug {
    /// `Some(detail)` if a debugger is attached.
    async fn debugger(&self) -> Option<String>;

    /// `Some(detail)` if the host looks like a known hypervisor.
    async fn virtual_machine(&self) -> Option<String>;
}

/// Receives detections from the monitor.
#[async_trait]
pub trait TamperHandler: Send + Sync {
    async fn on_tamper(&self, indicator: TamperIndicator);
}

/// Reads `/proc` and `/sys` on Linux. Reports nothing elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostProbe;

const VM_MARKERS: &[&str] = &[
    "kvm",
    "qemu",
    "vmware",
    "virtualbox",
    "xen",
    "hyper-v",
    "parallels",
    "bochs",
];

#[async_trait]
impl TamperProbe for HostProbe {
    async fn debugger(&self) -> Option<String> {
        let status = tokio::fs::read_to_string("/proc/self/status").await.ok()?;
        let tracer = tracer_pid(&status)?;
        (tracer != 0).then(|| format!("TracerPid {}", tracer))
    }

    async fn virtual_machine(&self) -> Option<String> {
        for path in ["/sys/class/dmi/id/product_name", "/sys/class/dmi/id/sys_vendor"] {
            if let Ok(value) = tokio::fs::read_to_string(path).await {
                let lower = value.trim().to_lowercase();
                if let Some(marker) = VM_MARKERS.iter().find(|m| lower.contains(*m)) {
                    return Some(format!("{} reports {}", path, marker));
                }
            }
        }
        let cpuinfo = tokio::fs::read_to_string("/proc/cpuinfo").await.ok()?;
        cpuinfo
            .lines()
            .filter(|l| l.starts_with("flags"))
            .any(|l| l.split_whitespace().any(|f| f == "hypervisor"))
            .then(|| "cpu hypervisor flag".to_string())
    }
}

/// Parse `TracerPid:` out of `/proc/<pid>/status`.
fn tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|l| l.strip_prefix("TracerPid:"))
        .and_then(|v| v.trim().parse().ok())
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Periodic tamper polling with cooperative cancellation.
pub struct AntiTamperMonitor {
    probe: Arc<dyn TamperProbe>,
    interval: Duration,
    running: Mutex<Option<Running>>,
    /// VM indicators are stable; report them once per monitor, not per start.
    vm_reported: Arc<AtomicBool>,
}

impl AntiTamperMonitor {
    pub fn new(probe: Arc<dyn TamperProbe>, interval: Duration) -> Self {
        Self {
            probe,
            interval,
            running: Mutex::new(None),
            vm_reported: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start polling. The handler is held weakly so the monitor never keeps
    /// the engine alive. Starting twice is a no-op.
    pub async fn start(&self, handler: Weak<dyn TamperHandler>) {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            debug!("Anti-tamper monitor already running");
            return;
        }

        debug!("Starting anti-tamper monitor with {:?} poll interval", self.interval);
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let probe = self.probe.clone();
        let poll_interval = self.interval;
        let vm_reported = self.vm_reported.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        for indicator in scan(probe.as_ref()).await {
                            if matches!(indicator, TamperIndicator::VirtualMachine(_))
                                && vm_reported.swap(true, Ordering::SeqCst)
                            {
                                continue;
                            }
                            let Some(handler) = handler.upgrade() else {
                                debug!("Anti-tamper handler dropped, stopping");
                                return;
                            };
                            handler.on_tamper(indicator).await;
                        }
                    }
                }
            }
            debug!("Anti-tamper monitor stopping");
        });

        *running = Some(Running { shutdown, task });
    }

    /// Signal the task to stop without waiting for it. The task exits at its
    /// next poll boundary. Safe to call from inside a [`TamperHandler`],
    /// where [`AntiTamperMonitor::stop`] would wait on itself.
    pub async fn halt(&self) -> bool {
        let Some(Running { shutdown, .. }) = self.running.lock().await.take() else {
            return false;
        };
        let _ = shutdown.send(true);
        debug!("Anti-tamper monitor halted");
        true
    }

    /// Signal the task to stop and wait for it. Returns whether it was running.
    pub async fn stop(&self) -> bool {
        let Some(Running { shutdown, task }) = self.running.lock().await.take() else {
            return false;
        };
        let _ = shutdown.send(true);
        if let Err(e) = task.await {
            if !e.is_cancelled() {
                warn!("Anti-tamper task ended abnormally: {}", e);
            }
        }
        true
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }
}

impl Debug for AntiTamperMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AntiTamperMonitor")
            .field("probe", &self.probe)
            .field("interval", &self.interval)
            .finish()
    }
}

async fn scan(probe: &dyn TamperProbe) -> Vec<TamperIndicator> {
    let mut found = Vec::new();
    if let Some(detail) = probe.debugger().await {
        found.push(TamperIndicator::Debugger(detail));
    }
    if let Some(detail) = probe.virtual_machine().await {
        found.push(TamperIndicator::VirtualMachine(detail));
    }
    found
}

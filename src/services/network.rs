use serde::Deserialize;
use tracing::{debug, info};

/// Platform lifecycle signals fed into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkSignal {
    /// The platform reports the network as gone.
    ConnectivityLost,
    /// The platform reports the network as back.
    ConnectivityRestored,
    /// The page or window was hidden.
    Hidden,
    /// The page or window became visible again.
    Visible,
    /// The page is about to be torn down.
    Unloading,
}

/// What the controller should do in response to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Re-fetch server state and replay pending saves.
    Reconcile,
    /// Opportunistically flush the current answer.
    Flush,
    /// Best-effort flush before the page goes away.
    UnloadFlush,
}

/// Tracks connectivity and visibility and turns transitions into triggers.
///
/// Repeated signals that do not change the tracked state produce nothing, so the server is
/// never polled when nothing happened.
#[derive(Debug)]
pub struct NetworkMonitor {
    online: bool,
    visible: bool,
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self {
            online: true,
            visible: true,
        }
    }
}

impl NetworkMonitor {
    /// Start online and visible.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current connectivity.
    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Current visibility.
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Record a signal and derive the trigger it causes, if any.
    pub fn observe(&mut self, signal: NetworkSignal) -> Option<Trigger> {
        debug!(?signal, online = self.online, visible = self.visible, "network signal");
        match signal {
            NetworkSignal::ConnectivityLost => {
                if self.online {
                    info!("connectivity lost; continuing offline");
                }
                self.online = false;
                None
            }
            NetworkSignal::ConnectivityRestored => {
                if self.online {
                    return None;
                }
                info!("connectivity restored; reconciling");
                self.online = true;
                Some(Trigger::Reconcile)
            }
            NetworkSignal::Hidden => {
                if !self.visible {
                    return None;
                }
                self.visible = false;
                Some(Trigger::Flush)
            }
            NetworkSignal::Visible => {
                if self.visible {
                    return None;
                }
                self.visible = true;
                self.online.then_some(Trigger::Reconcile)
            }
            NetworkSignal::Unloading => Some(Trigger::UnloadFlush),
        }
    }
}

//! Network reachability.

use tokio::sync::watch;
use tracing::info;

/// Whether the backend is reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    /// Requests can be sent.
    Online,
    /// Requests would fail; hold them.
    Offline,
}

/// Source of reachability information.
pub trait Reachability: Send + Sync {
    /// Returns the current state.
    fn state(&self) -> NetworkState;

    /// Subscribes to state changes.
    fn subscribe(&self) -> watch::Receiver<NetworkState>;

    /// Returns true if the backend is reachable.
    fn is_online(&self) -> bool {
        self.state() == NetworkState::Online
    }
}

/// Receives coarse network health signals derived from responses.
pub trait NetworkStateDelegate: Send + Sync {
    /// A response with an HTTP status arrived.
    fn did_receive_data(&self);

    /// A request failed in a way that suggests the network is gone.
    fn did_go_offline(&self);
}

/// Reachability fed by whoever observes the network.
#[derive(Debug)]
pub struct ReachabilityMonitor {
    sender: watch::Sender<NetworkState>,
}

impl ReachabilityMonitor {
    /// Creates a monitor with an initial state.
    pub fn new(initial: NetworkState) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    /// Creates a monitor that starts online.
    pub fn online() -> Self {
        Self::new(NetworkState::Online)
    }

    /// Updates the state, notifying subscribers on change.
    pub fn set_state(&self, state: NetworkState) {
        let changed = self.sender.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            info!(?state, "reachability changed");
        }
    }
}

impl Default for ReachabilityMonitor {
    fn default() -> Self {
        Self::online()
    }
}

impl Reachability for ReachabilityMonitor {
    fn state(&self) -> NetworkState {
        *self.sender.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.sender.subscribe()
    }
}

/// Delegate that feeds a [`ReachabilityMonitor`].
impl NetworkStateDelegate for ReachabilityMonitor {
    fn did_receive_data(&self) {
        self.set_state(NetworkState::Online);
    }

    fn did_go_offline(&self) {
        self.set_state(NetworkState::Offline);
    }
}

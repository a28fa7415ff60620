//! Network gating: decides whether sync traffic may run right now.
//!
//! The decision itself is a pure function of the configured requirement and
//! the observed connectivity; the only stateful piece is the monitor that
//! reports what the process currently sees.

use mbx_core::NetworkType;

/// Transport class the host is currently on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    None,
    Wifi,
    Ethernet,
    Cellular,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkState {
    pub transport: Transport,
    pub metered: bool,
}

impl NetworkState {
    pub fn offline() -> Self {
        Self {
            transport: Transport::None,
            metered: false,
        }
    }

    pub fn wifi() -> Self {
        Self {
            transport: Transport::Wifi,
            metered: false,
        }
    }

    pub fn ethernet() -> Self {
        Self {
            transport: Transport::Ethernet,
            metered: false,
        }
    }

    pub fn cellular() -> Self {
        Self {
            transport: Transport::Cellular,
            metered: true,
        }
    }

    pub fn is_online(&self) -> bool {
        self.transport != Transport::None
    }
}

/// True when `state` satisfies the configured requirement.
///
/// `NetworkType::None` means no network is required, so it passes even while
/// offline; it exists to let purely local bookkeeping run anywhere.
pub fn allows(required: NetworkType, state: NetworkState) -> bool {
    match required {
        NetworkType::Any => state.is_online(),
        // Ethernet counts as WiFi-class: stationary, unmetered-by-convention.
        NetworkType::WifiOnly => matches!(state.transport, Transport::Wifi | Transport::Ethernet),
        NetworkType::UnmeteredOnly => state.is_online() && !state.metered,
        NetworkType::None => true,
    }
}

/// Reports the connectivity the process currently sees.
pub trait NetworkMonitor: Send + Sync {
    fn current(&self) -> NetworkState;
}

/// Monitor backed by an explicitly set state. The daemon sets it from
/// whatever platform signal it has; tests flip it directly.
pub struct StaticNetworkMonitor {
    state: std::sync::RwLock<NetworkState>,
}

impl StaticNetworkMonitor {
    pub fn new(state: NetworkState) -> Self {
        Self {
            state: std::sync::RwLock::new(state),
        }
    }

    pub fn set(&self, state: NetworkState) {
        *self.state.write().expect("network state lock poisoned") = state;
    }
}

impl NetworkMonitor for StaticNetworkMonitor {
    fn current(&self) -> NetworkState {
        *self.state.read().expect("network state lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn any_requires_only_connectivity() {
        assert!(allows(NetworkType::Any, NetworkState::wifi()));
        assert!(allows(NetworkType::Any, NetworkState::ethernet()));
        assert!(allows(NetworkType::Any, NetworkState::cellular()));
        assert!(!allows(NetworkType::Any, NetworkState::offline()));
    }

    #[test]
    fn wifi_only_accepts_wifi_class_transports() {
        assert!(allows(NetworkType::WifiOnly, NetworkState::wifi()));
        assert!(allows(NetworkType::WifiOnly, NetworkState::ethernet()));
        assert!(!allows(NetworkType::WifiOnly, NetworkState::cellular()));
        assert!(!allows(NetworkType::WifiOnly, NetworkState::offline()));
    }

    #[test]
    fn unmetered_only_rejects_metered_links() {
        assert!(allows(NetworkType::UnmeteredOnly, NetworkState::wifi()));
        assert!(!allows(NetworkType::UnmeteredOnly, NetworkState::cellular()));
        let unmetered_cellular = NetworkState {
            transport: Transport::Cellular,
            metered: false,
        };
        assert!(allows(NetworkType::UnmeteredOnly, unmetered_cellular));
        assert!(!allows(NetworkType::UnmeteredOnly, NetworkState::offline()));
    }

    #[test]
    fn none_always_allows() {
        assert!(allows(NetworkType::None, NetworkState::offline()));
        assert!(allows(NetworkType::None, NetworkState::cellular()));
    }

    #[test]
    fn static_monitor_reflects_updates() {
        let monitor = StaticNetworkMonitor::new(NetworkState::offline());
        assert!(!monitor.current().is_online());
        monitor.set(NetworkState::wifi());
        assert_eq!(monitor.current(), NetworkState::wifi());
    }

    fn any_state() -> impl Strategy<Value = NetworkState> {
        (
            prop_oneof![
                Just(Transport::None),
                Just(Transport::Wifi),
                Just(Transport::Ethernet),
                Just(Transport::Cellular),
            ],
            any::<bool>(),
        )
            .prop_map(|(transport, metered)| NetworkState { transport, metered })
    }

    proptest! {
        #[test]
        fn offline_passes_nothing_but_none(metered in any::<bool>()) {
            let state = NetworkState { transport: Transport::None, metered };
            prop_assert!(!allows(NetworkType::Any, state));
            prop_assert!(!allows(NetworkType::WifiOnly, state));
            prop_assert!(!allows(NetworkType::UnmeteredOnly, state));
            prop_assert!(allows(NetworkType::None, state));
        }

        #[test]
        fn none_requirement_is_total(state in any_state()) {
            prop_assert!(allows(NetworkType::None, state));
        }

        #[test]
        fn wifi_only_implies_any(state in any_state()) {
            if allows(NetworkType::WifiOnly, state) {
                prop_assert!(allows(NetworkType::Any, state));
            }
        }
    }
}

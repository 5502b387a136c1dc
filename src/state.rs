use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Conversation-turn phase of the device. Exactly one value at any time,
/// mutated only by the engine on the scheduler thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum DeviceState {
    Idle = 0,
    Connecting = 1,
    Listening = 2,
    Speaking = 3,
}

impl DeviceState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => DeviceState::Connecting,
            2 => DeviceState::Listening,
            3 => DeviceState::Speaking,
            _ => DeviceState::Idle,
        }
    }
}

/// Whether the server or the user ends a listening turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ListeningMode {
    Manual,
    AutoStop,
}

impl ListeningMode {
    /// Wire form carried in the start-listening message.
    pub fn wire_name(&self) -> &'static str {
        match self {
            ListeningMode::Manual => "manual",
            ListeningMode::AutoStop => "auto",
        }
    }
}

/// Why an in-progress speaking turn was cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum AbortReason {
    None,
    WakeWordDetected,
}

impl AbortReason {
    /// Wire form of the reason; `None` is omitted from the message entirely.
    pub fn wire_name(&self) -> Option<&'static str> {
        match self {
            AbortReason::None => Option::None,
            AbortReason::WakeWordDetected => Some("wake_word_detected"),
        }
    }
}

/// Lock-free read-only mirror of the device state.
///
/// Written only by the engine during `set_state`; callbacks and pollers on
/// other threads read it to gate cheap decisions (queueing incoming audio,
/// ticking the capture poller) without touching the engine itself.
#[derive(Clone)]
pub struct StateSnapshot(Arc<AtomicU8>);

impl StateSnapshot {
    pub fn new(initial: DeviceState) -> Self {
        Self(Arc::new(AtomicU8::new(initial as u8)))
    }

    pub fn load(&self) -> DeviceState {
        DeviceState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: DeviceState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_roundtrip() {
        let snapshot = StateSnapshot::new(DeviceState::Idle);
        assert_eq!(snapshot.load(), DeviceState::Idle);

        snapshot.store(DeviceState::Speaking);
        assert_eq!(snapshot.load(), DeviceState::Speaking);

        let clone = snapshot.clone();
        clone.store(DeviceState::Listening);
        assert_eq!(snapshot.load(), DeviceState::Listening);
    }

    #[test]
    fn listening_mode_wire_names() {
        assert_eq!(ListeningMode::Manual.wire_name(), "manual");
        assert_eq!(ListeningMode::AutoStop.wire_name(), "auto");
    }

    #[test]
    fn abort_reason_wire_names() {
        assert_eq!(AbortReason::None.wire_name(), Option::None);
        assert_eq!(
            AbortReason::WakeWordDetected.wire_name(),
            Some("wake_word_detected")
        );
    }

    #[test]
    fn state_display_is_snake_case() {
        assert_eq!(DeviceState::Idle.to_string(), "idle");
        assert_eq!(DeviceState::Speaking.to_string(), "speaking");
    }
}

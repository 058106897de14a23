// Mode arbiter: FOREGROUND / BACKGROUND operating profile
//
// Host lifecycle signals drive the mode until an explicit switch pins it.
// The pin holds until process restart.

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperatingMode {
    Foreground,
    Background,
}

impl OperatingMode {
    /// Mode id used by host bindings (BACKGROUND_MODE = 0, FOREGROUND_MODE = 1)
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(OperatingMode::Background),
            1 => Some(OperatingMode::Foreground),
            _ => None,
        }
    }

    pub fn as_id(&self) -> u8 {
        match self {
            OperatingMode::Background => 0,
            OperatingMode::Foreground => 1,
        }
    }
}

impl std::fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperatingMode::Foreground => write!(f, "FOREGROUND"),
            OperatingMode::Background => write!(f, "BACKGROUND"),
        }
    }
}

/// Lifecycle of the host process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostSignal {
    /// App came to the foreground
    Resumed,
    /// App went to the background
    Backgrounded,
    /// App process is being torn down
    Terminated,
    /// OS is about to kill the process
    AbortRequested,
}

#[derive(Debug, Clone)]
pub struct ModeArbiter {
    mode: OperatingMode,
    pinned: bool,
}

impl ModeArbiter {
    pub fn new(initial: OperatingMode) -> Self {
        Self {
            mode: initial,
            pinned: false,
        }
    }

    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    /// Whether an explicit switch currently overrides lifecycle signals
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Apply a host lifecycle signal. Returns the new mode if it changed.
    pub fn on_lifecycle(&mut self, signal: HostSignal) -> Option<OperatingMode> {
        let target = match signal {
            HostSignal::Resumed => OperatingMode::Foreground,
            HostSignal::Backgrounded => OperatingMode::Background,
            HostSignal::Terminated | HostSignal::AbortRequested => return None,
        };
        if self.pinned {
            debug!("Ignoring {:?}: mode pinned to {}", signal, self.mode);
            return None;
        }
        self.set(target)
    }

    /// Explicit override. Pins the mode. Returns the new mode if it changed.
    pub fn switch_mode(&mut self, mode: OperatingMode) -> Option<OperatingMode> {
        self.pinned = true;
        self.set(mode)
    }

    fn set(&mut self, mode: OperatingMode) -> Option<OperatingMode> {
        if self.mode == mode {
            return None;
        }
        self.mode = mode;
        Some(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_drives_mode() {
        let mut arbiter = ModeArbiter::new(OperatingMode::Background);
        assert_eq!(arbiter.on_lifecycle(HostSignal::Resumed), Some(OperatingMode::Foreground));
        assert_eq!(arbiter.on_lifecycle(HostSignal::Resumed), None);
        assert_eq!(arbiter.on_lifecycle(HostSignal::Backgrounded), Some(OperatingMode::Background));
        assert_eq!(arbiter.on_lifecycle(HostSignal::Terminated), None);
    }

    #[test]
    fn test_explicit_switch_is_never_overridden() {
        let mut arbiter = ModeArbiter::new(OperatingMode::Background);
        assert_eq!(arbiter.switch_mode(OperatingMode::Foreground), Some(OperatingMode::Foreground));
        assert!(arbiter.is_pinned());

        for signal in [HostSignal::Backgrounded, HostSignal::Resumed, HostSignal::Backgrounded] {
            assert_eq!(arbiter.on_lifecycle(signal), None);
            assert_eq!(arbiter.mode(), OperatingMode::Foreground);
        }

        assert_eq!(arbiter.switch_mode(OperatingMode::Background), Some(OperatingMode::Background));
        assert_eq!(arbiter.on_lifecycle(HostSignal::Resumed), None);
        assert_eq!(arbiter.mode(), OperatingMode::Background);
    }

    #[test]
    fn test_mode_ids() {
        assert_eq!(OperatingMode::from_id(0), Some(OperatingMode::Background));
        assert_eq!(OperatingMode::from_id(1), Some(OperatingMode::Foreground));
        assert_eq!(OperatingMode::from_id(7), None);
        assert_eq!(OperatingMode::Foreground.as_id(), 1);
    }
}

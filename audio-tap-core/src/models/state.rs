use std::fmt;

/// Capture pipeline state machine.
///
/// State transitions:
/// ```text
/// idle → setup → capturing
///          ↑         ↓ stop
///          └─────────┘
/// setup / capturing → idle   (destroy, topology loss, failed setup)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    #[default]
    Idle,
    Setup,
    Capturing,
}

impl PipelineState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Whether a capture session (tap, aggregate device, IOProc) exists.
    pub fn is_setup(&self) -> bool {
        matches!(self, Self::Setup | Self::Capturing)
    }

    pub fn is_capturing(&self) -> bool {
        matches!(self, Self::Capturing)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Setup => "setup",
            Self::Capturing => "capturing",
        };
        f.write_str(name)
    }
}

use serde::Serialize;

use crate::layout::LayoutError;

/// Global run state stored in the control region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum RunState {
    Idle = 0,
    Home = 1,
    Print = 2,
    Pause = 3,
    Stop = 4,
    Resume = 5,
    Test = 6,
    LoadFilament = 7,
    UnloadFilament = 8,
}

impl RunState {
    pub fn from_u32(value: u32) -> Result<Self, LayoutError> {
        Ok(match value {
            0 => RunState::Idle,
            1 => RunState::Home,
            2 => RunState::Print,
            3 => RunState::Pause,
            4 => RunState::Stop,
            5 => RunState::Resume,
            6 => RunState::Test,
            7 => RunState::LoadFilament,
            8 => RunState::UnloadFilament,
            other => return Err(LayoutError::InvalidRunState(other)),
        })
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn is_filament(self) -> bool {
        matches!(self, RunState::LoadFilament | RunState::UnloadFilament)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Idle => "IDLE",
            RunState::Home => "HOME",
            RunState::Print => "PRINT",
            RunState::Pause => "PAUSE",
            RunState::Stop => "STOP",
            RunState::Resume => "RESUME",
            RunState::Test => "TEST",
            RunState::LoadFilament => "LOAD_FILAMENT",
            RunState::UnloadFilament => "UNLOAD_FILAMENT",
        };
        f.write_str(name)
    }
}

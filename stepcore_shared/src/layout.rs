//! Byte layout of the memory shared with the coprocessor.
//!
//! The region is `N` queue records followed by one control block. Every
//! multi-byte field is a native-endian fixed-width integer. Offsets here are
//! an ABI contract with the coprocessor program.

use thiserror::Error;

pub const RECORD_SIZE: usize = 64;
pub const RECORD_WORDS: usize = RECORD_SIZE / 4;
pub const CONTROL_SIZE: usize = 76;
pub const CONTROL_WORDS: usize = CONTROL_SIZE / 4;

/// Extruder slots addressable by the select and direction bytes.
pub const EXTRUDER_SLOTS: usize = 4;
/// Select bit used instead of the one-hot extruder index in dual-motor mode.
pub const DUAL_MOTOR_BIT: u8 = 0x80;

// Record field offsets.
pub const REC_STATE: usize = 0;
pub const REC_KIND: usize = 1;
pub const REC_DIRECTION: usize = 2;
pub const REC_EXTRUDER_SELECT: usize = 3;
pub const REC_EXTRUDER_DIRECTION: usize = 4;
pub const REC_STEPS: usize = 8;
pub const REC_ACCEL_STEPS: usize = 24;
pub const REC_CRUISE_STEPS: usize = 28;
pub const REC_DECEL_STEPS: usize = 32;
pub const REC_ENTRY_DELAY: usize = 36;
pub const REC_CRUISE_DELAY: usize = 40;
pub const REC_EXIT_DELAY: usize = 44;
pub const REC_ACCEL_INCREMENT: usize = 48;
pub const REC_DECEL_INCREMENT: usize = 52;
pub const REC_COMMAND: usize = 56;

// Control field offsets, relative to the start of the control block.
pub const CTL_RUN_STATE: usize = 0;
pub const CTL_HOMING_AXES: usize = 4;
pub const CTL_HOMING_DIR: usize = 8;
pub const CTL_HOMING_DELAY: usize = 12;
pub const CTL_POSITION: usize = 16;
pub const CTL_PAUSE_POSITION: usize = 32;
pub const CTL_WRITE_CURSOR: usize = 44;
pub const CTL_BOARD_FLAGS: usize = 48;
pub const CTL_MCODE_COUNT: usize = 52;
pub const CTL_PAUSE_LIFT: usize = 56;
pub const CTL_STOP_LIFT: usize = 60;
pub const CTL_DUAL_MOTOR: usize = 64;
pub const CTL_ENDSTOP_INVERT: usize = 68;
pub const CTL_READ_CURSOR: usize = 72;

const _: () = assert!(REC_COMMAND + 8 == RECORD_SIZE);
const _: () = assert!(CTL_READ_CURSOR + 4 == CONTROL_SIZE);
const _: () = assert!(RECORD_SIZE % 4 == 0 && CONTROL_SIZE % 4 == 0);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("access at byte offset {offset} (len {len}) is outside the {size}-byte region or misaligned")]
    OutOfBounds { offset: usize, len: usize, size: usize },
    #[error("invalid slot state byte {0}")]
    InvalidSlotState(u8),
    #[error("invalid run state value {0}")]
    InvalidRunState(u32),
}

/// Life-cycle of one ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    Empty = 0,
    Filled = 1,
    Exit = 2,
}

impl SlotState {
    pub fn from_u8(value: u8) -> Result<Self, LayoutError> {
        match value {
            0 => Ok(SlotState::Empty),
            1 => Ok(SlotState::Filled),
            2 => Ok(SlotState::Exit),
            other => Err(LayoutError::InvalidSlotState(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RecordKind {
    #[default]
    Move = 0,
    Command = 1,
}

impl RecordKind {
    /// Unknown kinds are treated as commands so the consumer never moves on garbage.
    pub fn from_u8(value: u8) -> Self {
        if value == 0 { RecordKind::Move } else { RecordKind::Command }
    }
}

/// One coprocessor queue element without its state byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueRecord {
    pub kind: RecordKind,
    pub direction: u8,
    pub extruder_select: u8,
    pub extruder_direction: u8,
    pub steps: [u32; 4],
    pub accel_steps: u32,
    pub cruise_steps: u32,
    pub decel_steps: u32,
    pub entry_delay: u32,
    pub cruise_delay: u32,
    pub exit_delay: u32,
    pub accel_increment: u32,
    pub decel_increment: u32,
    pub command: u32,
}

impl QueueRecord {
    pub fn command(code: u32) -> Self {
        Self {
            kind: RecordKind::Command,
            command: code,
            ..Self::default()
        }
    }

    pub fn total_steps(&self) -> u32 {
        self.accel_steps + self.cruise_steps + self.decel_steps
    }

    /// Encode as the sixteen native-endian words of a slot.
    pub fn to_words(&self, state: SlotState) -> [u32; RECORD_WORDS] {
        let mut words = [0u32; RECORD_WORDS];
        words[0] = u32::from_ne_bytes([
            state as u8,
            self.kind as u8,
            self.direction,
            self.extruder_select,
        ]);
        words[1] = u32::from_ne_bytes([self.extruder_direction, 0, 0, 0]);
        words[REC_STEPS / 4..REC_STEPS / 4 + 4].copy_from_slice(&self.steps);
        words[REC_ACCEL_STEPS / 4] = self.accel_steps;
        words[REC_CRUISE_STEPS / 4] = self.cruise_steps;
        words[REC_DECEL_STEPS / 4] = self.decel_steps;
        words[REC_ENTRY_DELAY / 4] = self.entry_delay;
        words[REC_CRUISE_DELAY / 4] = self.cruise_delay;
        words[REC_EXIT_DELAY / 4] = self.exit_delay;
        words[REC_ACCEL_INCREMENT / 4] = self.accel_increment;
        words[REC_DECEL_INCREMENT / 4] = self.decel_increment;
        words[REC_COMMAND / 4] = self.command;
        words
    }

    /// Decode a slot, returning its state byte alongside the record.
    pub fn from_words(words: &[u32; RECORD_WORDS]) -> Result<(SlotState, Self), LayoutError> {
        let [state, kind, direction, extruder_select] = words[0].to_ne_bytes();
        let state = SlotState::from_u8(state)?;
        let mut steps = [0u32; 4];
        steps.copy_from_slice(&words[REC_STEPS / 4..REC_STEPS / 4 + 4]);
        let record = Self {
            kind: RecordKind::from_u8(kind),
            direction,
            extruder_select,
            extruder_direction: words[1].to_ne_bytes()[0],
            steps,
            accel_steps: words[REC_ACCEL_STEPS / 4],
            cruise_steps: words[REC_CRUISE_STEPS / 4],
            decel_steps: words[REC_DECEL_STEPS / 4],
            entry_delay: words[REC_ENTRY_DELAY / 4],
            cruise_delay: words[REC_CRUISE_DELAY / 4],
            exit_delay: words[REC_EXIT_DELAY / 4],
            accel_increment: words[REC_ACCEL_INCREMENT / 4],
            decel_increment: words[REC_DECEL_INCREMENT / 4],
            command: words[REC_COMMAND / 4],
        };
        Ok((state, record))
    }

    pub fn to_bytes(&self, state: SlotState) -> [u8; RECORD_SIZE] {
        let mut bytes = [0u8; RECORD_SIZE];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(self.to_words(state)) {
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
        bytes
    }
}

/// Total bytes for a ring of `slots` records plus the control block.
pub const fn region_size(slots: usize) -> usize {
    slots * RECORD_SIZE + CONTROL_SIZE
}

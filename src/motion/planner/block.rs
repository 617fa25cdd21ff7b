use crate::motion::NUM_AXES;

/// What a block asks the coprocessor to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockKind {
    #[default]
    Move,
    /// Embedded non-motion command, forwarded in order with the moves around it.
    Command(u32),
}

/// One planned linear segment and its velocity trapezoid.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    pub kind: BlockKind,
    pub steps: [u32; NUM_AXES],
    /// Bit set per axis moving in the negative direction.
    pub direction_bits: u8,
    pub step_event_count: u32,
    pub active_extruder: u8,
    pub millimeters: f64,

    pub nominal_speed: f64,
    pub nominal_rate: u32,
    pub entry_speed: f64,
    pub max_entry_speed: f64,
    /// mm/s²
    pub acceleration: f64,
    /// steps/s²
    pub acceleration_st: f64,

    pub accelerate_until: u32,
    pub decelerate_after: u32,
    pub initial_rate: u32,
    pub final_rate: u32,

    pub nominal_length_reached: bool,
    pub recalculate: bool,
    pub busy: bool,
}

impl Block {
    pub fn command(code: u32) -> Self {
        Self {
            kind: BlockKind::Command(code),
            ..Self::default()
        }
    }

    pub fn is_move(&self) -> bool {
        self.kind == BlockKind::Move
    }

    pub fn cruise_steps(&self) -> u32 {
        self.decelerate_after - self.accelerate_until
    }

    pub fn decelerate_steps(&self) -> u32 {
        self.step_event_count - self.decelerate_after
    }
}

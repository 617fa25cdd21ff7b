//! Record of what the simulated coprocessor executed.

use serde::Serialize;
use stepcore_shared::layout::{QueueRecord, RecordKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// One executed queue record and the position after it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceRow {
    pub index: u64,
    pub slot: usize,
    pub kind: &'static str,
    pub direction: u8,
    pub steps_x: u32,
    pub steps_y: u32,
    pub steps_z: u32,
    pub steps_e: u32,
    pub accel_steps: u32,
    pub cruise_steps: u32,
    pub decel_steps: u32,
    pub entry_delay: u32,
    pub cruise_delay: u32,
    pub exit_delay: u32,
    pub command: u32,
    pub pos_x: i32,
    pub pos_y: i32,
    pub pos_z: i32,
    pub pos_e: i32,
}

impl TraceRow {
    pub fn new(index: u64, slot: usize, record: &QueueRecord, position: [i32; 4]) -> Self {
        Self {
            index,
            slot,
            kind: match record.kind {
                RecordKind::Move => "move",
                RecordKind::Command => "command",
            },
            direction: record.direction,
            steps_x: record.steps[0],
            steps_y: record.steps[1],
            steps_z: record.steps[2],
            steps_e: record.steps[3],
            accel_steps: record.accel_steps,
            cruise_steps: record.cruise_steps,
            decel_steps: record.decel_steps,
            entry_delay: record.entry_delay,
            cruise_delay: record.cruise_delay,
            exit_delay: record.exit_delay,
            command: record.command,
            pos_x: position[0],
            pos_y: position[1],
            pos_z: position[2],
            pos_e: position[3],
        }
    }

    pub fn position(&self) -> [i32; 4] {
        [self.pos_x, self.pos_y, self.pos_z, self.pos_e]
    }
}

pub fn write_csv<W: std::io::Write>(writer: W, rows: &[TraceRow]) -> Result<(), TraceError> {
    let mut wtr = csv::Writer::from_writer(writer);
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_csv_file(path: &std::path::Path, rows: &[TraceRow]) -> Result<(), TraceError> {
    let file = std::fs::File::create(path)?;
    write_csv(file, rows)?;
    tracing::info!("Wrote {} trace rows to {}", rows.len(), path.display());
    Ok(())
}

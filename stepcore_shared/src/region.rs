//! In-process model of the memory shared with the coprocessor.
//!
//! The region is kept as a slice of `AtomicU32` words so both sides can touch
//! it without `unsafe`. Record bodies use relaxed accesses; the word carrying
//! a slot's state byte is stored with `Release` and loaded with `Acquire`, and
//! so is the run-state word.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::layout::*;
use crate::run_state::RunState;

#[derive(Debug)]
pub struct SharedRegion {
    words: Box<[AtomicU32]>,
    slots: usize,
}

impl SharedRegion {
    /// A zeroed region: every slot EMPTY, run state IDLE, cursors at zero.
    pub fn new(slots: usize) -> Self {
        let words = (0..region_size(slots) / 4)
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { words, slots }
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn size(&self) -> usize {
        self.words.len() * 4
    }

    fn control_base(&self) -> usize {
        self.slots * RECORD_SIZE
    }

    fn word_at(&self, offset: usize) -> Result<&AtomicU32, LayoutError> {
        if offset % 4 != 0 {
            return Err(self.out_of_bounds(offset));
        }
        self.words.get(offset / 4).ok_or_else(|| self.out_of_bounds(offset))
    }

    fn out_of_bounds(&self, offset: usize) -> LayoutError {
        LayoutError::OutOfBounds { offset, len: 4, size: self.size() }
    }

    /// Relaxed read of the word at a byte offset.
    pub fn read_u32(&self, offset: usize) -> Result<u32, LayoutError> {
        Ok(self.word_at(offset)?.load(Ordering::Relaxed))
    }

    pub fn write_u32(&self, offset: usize, value: u32) -> Result<(), LayoutError> {
        self.word_at(offset)?.store(value, Ordering::Relaxed);
        Ok(())
    }

    /// Byte offset of a slot inside the region.
    pub fn slot_offset(&self, slot: usize) -> Result<usize, LayoutError> {
        if slot >= self.slots {
            return Err(LayoutError::OutOfBounds {
                offset: slot * RECORD_SIZE,
                len: RECORD_SIZE,
                size: self.size(),
            });
        }
        Ok(slot * RECORD_SIZE)
    }

    pub fn slot_state(&self, slot: usize) -> Result<SlotState, LayoutError> {
        let head = self.word_at(self.slot_offset(slot)?)?.load(Ordering::Acquire);
        SlotState::from_u8(head.to_ne_bytes()[REC_STATE])
    }

    /// Write a full record, then flip the state byte with a release store.
    ///
    /// Until the final store the slot reads as EMPTY, so a consumer polling
    /// the state never sees a half-written record.
    pub fn publish_slot(
        &self,
        slot: usize,
        record: &QueueRecord,
        state: SlotState,
    ) -> Result<(), LayoutError> {
        let base = self.slot_offset(slot)?;
        let staged = record.to_words(SlotState::Empty);
        for (index, word) in staged.iter().enumerate() {
            self.word_at(base + index * 4)?.store(*word, Ordering::Relaxed);
        }
        let head = record.to_words(state)[0];
        self.word_at(base)?.store(head, Ordering::Release);
        Ok(())
    }

    /// Consumer side: hand a slot back to the producer.
    pub fn release_slot(&self, slot: usize) -> Result<(), LayoutError> {
        let head = self.word_at(self.slot_offset(slot)?)?;
        let mut bytes = head.load(Ordering::Relaxed).to_ne_bytes();
        bytes[REC_STATE] = SlotState::Empty as u8;
        head.store(u32::from_ne_bytes(bytes), Ordering::Release);
        Ok(())
    }

    pub fn read_record(&self, slot: usize) -> Result<(SlotState, QueueRecord), LayoutError> {
        let base = self.slot_offset(slot)?;
        let mut words = [0u32; RECORD_WORDS];
        words[0] = self.word_at(base)?.load(Ordering::Acquire);
        for (index, word) in words.iter_mut().enumerate().skip(1) {
            *word = self.word_at(base + index * 4)?.load(Ordering::Relaxed);
        }
        QueueRecord::from_words(&words)
    }

    fn ctl(&self, field: usize) -> &AtomicU32 {
        &self.words[(self.control_base() + field) / 4]
    }

    fn ctl_get(&self, field: usize) -> u32 {
        self.ctl(field).load(Ordering::Relaxed)
    }

    fn ctl_set(&self, field: usize, value: u32) {
        self.ctl(field).store(value, Ordering::Relaxed)
    }

    pub fn run_state(&self) -> Result<RunState, LayoutError> {
        RunState::from_u32(self.ctl(CTL_RUN_STATE).load(Ordering::Acquire))
    }

    pub fn set_run_state(&self, state: RunState) {
        self.ctl(CTL_RUN_STATE).store(state.as_u32(), Ordering::Release)
    }

    /// Coprocessor-tracked absolute position, in steps.
    pub fn position(&self) -> [i32; 4] {
        std::array::from_fn(|axis| self.ctl_get(CTL_POSITION + axis * 4) as i32)
    }

    pub fn set_position(&self, position: [i32; 4]) {
        for (axis, steps) in position.iter().enumerate() {
            self.ctl_set(CTL_POSITION + axis * 4, *steps as u32);
        }
    }

    pub fn pause_position(&self) -> [i32; 3] {
        std::array::from_fn(|axis| self.ctl_get(CTL_PAUSE_POSITION + axis * 4) as i32)
    }

    pub fn set_pause_position(&self, position: [i32; 3]) {
        for (axis, steps) in position.iter().enumerate() {
            self.ctl_set(CTL_PAUSE_POSITION + axis * 4, *steps as u32);
        }
    }

    pub fn write_cursor(&self) -> u32 {
        self.ctl(CTL_WRITE_CURSOR).load(Ordering::Acquire)
    }

    pub fn set_write_cursor(&self, cursor: u32) {
        self.ctl(CTL_WRITE_CURSOR).store(cursor, Ordering::Release)
    }

    pub fn read_cursor(&self) -> u32 {
        self.ctl(CTL_READ_CURSOR).load(Ordering::Acquire)
    }

    pub fn set_read_cursor(&self, cursor: u32) {
        self.ctl(CTL_READ_CURSOR).store(cursor, Ordering::Release)
    }

    pub fn set_homing(&self, axes: u32, direction: u32, step_delay: u32) {
        self.ctl_set(CTL_HOMING_AXES, axes);
        self.ctl_set(CTL_HOMING_DIR, direction);
        self.ctl_set(CTL_HOMING_DELAY, step_delay);
    }

    /// Axis mask, direction bits and step delay of the last homing request.
    pub fn homing(&self) -> (u32, u32, u32) {
        (
            self.ctl_get(CTL_HOMING_AXES),
            self.ctl_get(CTL_HOMING_DIR),
            self.ctl_get(CTL_HOMING_DELAY),
        )
    }

    pub fn mcode_count(&self) -> u32 {
        self.ctl_get(CTL_MCODE_COUNT)
    }

    pub fn increment_mcode_count(&self) {
        self.ctl(CTL_MCODE_COUNT).fetch_add(1, Ordering::AcqRel);
    }

    pub fn pause_lift(&self) -> u32 {
        self.ctl_get(CTL_PAUSE_LIFT)
    }

    pub fn set_pause_lift(&self, steps: u32) {
        self.ctl_set(CTL_PAUSE_LIFT, steps)
    }

    pub fn stop_lift(&self) -> u32 {
        self.ctl_get(CTL_STOP_LIFT)
    }

    pub fn set_stop_lift(&self, steps: u32) {
        self.ctl_set(CTL_STOP_LIFT, steps)
    }

    pub fn dual_motor(&self) -> bool {
        self.ctl_get(CTL_DUAL_MOTOR) != 0
    }

    pub fn set_dual_motor(&self, enabled: bool) {
        self.ctl_set(CTL_DUAL_MOTOR, u32::from(enabled))
    }

    pub fn endstop_invert(&self) -> u32 {
        self.ctl_get(CTL_ENDSTOP_INVERT)
    }

    pub fn set_endstop_invert(&self, mask: u32) {
        self.ctl_set(CTL_ENDSTOP_INVERT, mask)
    }

    pub fn board_flags(&self) -> u32 {
        self.ctl_get(CTL_BOARD_FLAGS)
    }

    pub fn set_board_flags(&self, flags: u32) {
        self.ctl_set(CTL_BOARD_FLAGS, flags)
    }

    /// Native-endian byte image of the whole region.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.words
            .iter()
            .flat_map(|word| word.load(Ordering::Relaxed).to_ne_bytes())
            .collect()
    }
}

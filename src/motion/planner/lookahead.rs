//! Reverse and forward passes over the buffered blocks.
//!
//! Command blocks split the buffer into independent runs: the move before a
//! command brakes to the minimum planner speed and the move after it starts
//! from its own safe speed.

use super::block::Block;
use super::ring::BlockRing;
use super::trapezoid::{calculate_trapezoid, max_allowable_speed};

pub fn recalculate(ring: &mut BlockRing, minimum_planner_speed: f64) {
    let indices = ring.indices();
    let runs: Vec<Vec<usize>> = indices
        .split(|slot| !ring.get(*slot).is_move())
        .filter(|run| !run.is_empty())
        .map(<[usize]>::to_vec)
        .collect();
    for run in &runs {
        reverse_pass(ring, run);
        forward_pass(ring, run);
        recalculate_trapezoids(ring, run, minimum_planner_speed);
    }
}

fn reverse_pass(ring: &mut BlockRing, run: &[usize]) {
    // The newest block has no successor, its exit is left unconstrained.
    for pair in run.windows(2).rev() {
        let next_entry = ring.get(pair[1]).entry_speed;
        let current = ring.get_mut(pair[0]);
        if current.busy || current.entry_speed == current.max_entry_speed {
            continue;
        }
        let entry_speed = if !current.nominal_length_reached && current.max_entry_speed > next_entry {
            current.max_entry_speed.min(max_allowable_speed(
                -current.acceleration,
                next_entry,
                current.millimeters,
            ))
        } else {
            current.max_entry_speed
        };
        set_entry_speed(current, entry_speed);
    }
}

fn forward_pass(ring: &mut BlockRing, run: &[usize]) {
    for pair in run.windows(2) {
        let previous = ring.get(pair[0]);
        if previous.nominal_length_reached {
            continue;
        }
        let (prev_entry, prev_accel, prev_mm) =
            (previous.entry_speed, previous.acceleration, previous.millimeters);
        let current = ring.get_mut(pair[1]);
        if current.busy || prev_entry >= current.entry_speed {
            continue;
        }
        let entry_speed = current
            .entry_speed
            .min(max_allowable_speed(-prev_accel, prev_entry, prev_mm));
        set_entry_speed(current, entry_speed);
    }
}

fn recalculate_trapezoids(ring: &mut BlockRing, run: &[usize], minimum_planner_speed: f64) {
    for (position, slot) in run.iter().enumerate() {
        let next = run.get(position + 1).map(|next| {
            let next = ring.get(*next);
            (next.entry_speed, next.recalculate)
        });
        let current = ring.get_mut(*slot);
        let exit_speed = match next {
            Some((entry, next_dirty)) => {
                if !current.recalculate && !next_dirty {
                    continue;
                }
                entry
            }
            None => minimum_planner_speed,
        };
        let nominal = current.nominal_speed;
        if nominal > 0.0 {
            calculate_trapezoid(current, current.entry_speed / nominal, exit_speed / nominal);
        }
        current.recalculate = false;
    }
}

fn set_entry_speed(block: &mut Block, entry_speed: f64) {
    if block.entry_speed != entry_speed {
        block.entry_speed = entry_speed;
        block.recalculate = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::planner::BlockKind;

    fn cruise_block(entry_speed: f64, max_entry_speed: f64) -> Block {
        let mut block = Block {
            step_event_count: 1_000,
            millimeters: 10.0,
            nominal_speed: 50.0,
            nominal_rate: 5_000,
            acceleration: 500.0,
            acceleration_st: 50_000.0,
            entry_speed,
            max_entry_speed,
            recalculate: true,
            ..Block::default()
        };
        calculate_trapezoid(&mut block, entry_speed / 50.0, 0.0);
        block
    }

    fn trapezoids(ring: &BlockRing) -> Vec<(u32, u32, u32, u32)> {
        ring.indices()
            .into_iter()
            .map(|slot| {
                let b = ring.get(slot);
                (b.accelerate_until, b.decelerate_after, b.initial_rate, b.final_rate)
            })
            .collect()
    }

    #[test]
    fn reverse_pass_raises_entry_toward_junction_limit() {
        let mut ring = BlockRing::new(8);
        ring.push(cruise_block(5.0, 5.0));
        ring.push(cruise_block(1.0, 30.0));
        ring.push(cruise_block(1.0, 30.0));
        recalculate(&mut ring, 0.05);
        let blocks: Vec<Block> = ring.indices().into_iter().map(|s| ring.get(s).clone()).collect();
        // Middle block may enter faster because the newest one can still brake.
        assert!(blocks[1].entry_speed > 1.0);
        assert!(blocks[1].entry_speed <= blocks[1].max_entry_speed);
        // The previous block now exits at the raised entry speed.
        assert!(blocks[0].final_rate > 120);
        assert!(blocks.iter().all(|b| !b.recalculate));
    }

    #[test]
    fn second_recalculate_changes_nothing() {
        let mut ring = BlockRing::new(8);
        ring.push(cruise_block(0.5, 8.0));
        ring.push(cruise_block(0.5, 40.0));
        ring.push(cruise_block(0.5, 12.0));
        ring.push(cruise_block(0.5, 40.0));
        recalculate(&mut ring, 0.05);
        let first = trapezoids(&ring);
        recalculate(&mut ring, 0.05);
        assert_eq!(trapezoids(&ring), first);
    }

    #[test]
    fn busy_block_keeps_its_plan() {
        let mut ring = BlockRing::new(8);
        let slot = ring.push(cruise_block(1.0, 30.0)).unwrap();
        ring.get_mut(slot).busy = true;
        let before = ring.get(slot).clone();
        ring.push(cruise_block(1.0, 30.0));
        recalculate(&mut ring, 0.05);
        let after = ring.get(slot);
        assert_eq!(after.entry_speed, before.entry_speed);
        assert_eq!(after.final_rate, before.final_rate);
        assert_eq!(after.accelerate_until, before.accelerate_until);
    }

    #[test]
    fn command_blocks_split_runs() {
        let mut ring = BlockRing::new(8);
        ring.push(cruise_block(1.0, 30.0));
        ring.push(Block::command(7));
        ring.push(cruise_block(30.0, 30.0));
        recalculate(&mut ring, 0.05);
        let first = ring.get(0);
        // Exit of the move before the command stays at the floor rate.
        assert_eq!(first.final_rate, 120);
        assert_eq!(ring.get(1).kind, BlockKind::Command(7));
    }
}

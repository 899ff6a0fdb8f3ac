//! Re-serialization of a rewritten instruction list.
//!
//! After register allocation the in-memory instructions carry compacted
//! register ids and shifted literal indices. Emitting them back out is a
//! small relocation problem: dead instructions are dropped and shrunken
//! literal indices may fit a narrower encoding, so every later offset moves
//! and every branch magnitude has to be recomputed against the new layout.
//! Branch widths start at one byte and grow until the layout is stable;
//! widths never shrink once grown, so the loop terminates.

use std::collections::HashMap;

use tracing::debug;

use crate::{
    bytecode::{
        function::LiteralBoundaries,
        instruction::{InstFlags, Instruction},
        opcode::{OpcodeTable, OperandShape, EXT_OPCODE_BASE},
    },
    Result,
};

/// Layout state for one live instruction during relocation.
struct Layout {
    inst_idx: usize,
    new_offset: u32,
    branch_width: u8,
    /// `None` while the branch family allows resizing.
    fixed_width: bool,
}

/// Re-encodes `instructions` into a fresh byte stream, dropping instructions
/// flagged [`InstFlags::DEAD`] and terminating with the table's end opcode.
///
/// # Errors
///
/// Returns [`crate::Error::Malformed`] if a branch magnitude cannot be
/// represented in the widest available encoding.
///
/// # Panics
///
/// Panics if a branch targets an offset that is not a live instruction
/// boundary or the stream end; targets are produced by the decoder and the
/// CFG passes, so a miss is a contract violation.
pub fn encode_function(
    instructions: &[Instruction],
    table: &OpcodeTable,
    bounds: &LiteralBoundaries,
) -> Result<Vec<u8>> {
    let live: Vec<usize> = instructions
        .iter()
        .enumerate()
        .filter(|(_, inst)| !inst.has(InstFlags::DEAD))
        .map(|(idx, _)| idx)
        .collect();

    let old_end = instructions
        .last()
        .map_or(0, |inst| inst.next_offset());

    let mut layouts: Vec<Layout> = live
        .iter()
        .map(|&inst_idx| {
            let inst = &instructions[inst_idx];
            let (branch_width, fixed_width) = if inst.is_jump() {
                initial_branch_width(inst, table)
            } else {
                (0, true)
            };
            Layout {
                inst_idx,
                new_offset: 0,
                branch_width,
                fixed_width,
            }
        })
        .collect();

    // Old offset -> position in the live layout list, for branch retargeting.
    let old_to_layout: HashMap<u32, usize> = layouts
        .iter()
        .enumerate()
        .map(|(pos, layout)| (instructions[layout.inst_idx].offset, pos))
        .collect();

    loop {
        let mut offset = 0u32;
        for layout in &mut layouts {
            layout.new_offset = offset;
            offset += encoded_size(&instructions[layout.inst_idx], layout.branch_width, bounds);
        }
        let new_end = offset;

        let mut grew = false;
        for pos in 0..layouts.len() {
            let inst = &instructions[layouts[pos].inst_idx];
            if !inst.is_jump() {
                continue;
            }

            let magnitude =
                branch_magnitude(inst, pos, &layouts, &old_to_layout, old_end, new_end);
            let needed = width_for(magnitude);

            if needed > layouts[pos].branch_width {
                if layouts[pos].fixed_width {
                    return Err(malformed_error!(
                        "branch at {:#x} needs {} offset bytes, encoding allows {}",
                        inst.offset,
                        needed,
                        layouts[pos].branch_width
                    ));
                }
                layouts[pos].branch_width = needed;
                grew = true;
            }
        }

        if !grew {
            break;
        }
    }

    let new_end = layouts
        .last()
        .map_or(0, |layout| {
            layout.new_offset + encoded_size(&instructions[layout.inst_idx], layout.branch_width, bounds)
        });

    let mut bytes = Vec::with_capacity(new_end as usize + 1);
    for pos in 0..layouts.len() {
        let layout = &layouts[pos];
        let inst = &instructions[layout.inst_idx];
        debug_assert_eq!(layout.new_offset as usize, bytes.len());

        emit_opcode(&mut bytes, inst, layout, table)?;

        if inst.is_jump() {
            let magnitude =
                branch_magnitude(inst, pos, &layouts, &old_to_layout, old_end, new_end);
            emit_branch(&mut bytes, magnitude, layout.branch_width);
        }

        for lit in &inst.operands.literals {
            emit_literal_index(&mut bytes, lit.index, bounds);
        }
    }

    if let Some(end) = table.end_opcode() {
        bytes.push(end as u8);
    }

    debug!(
        live = layouts.len(),
        dropped = instructions.len() - layouts.len(),
        bytes = bytes.len(),
        "re-encoded instruction stream"
    );

    Ok(bytes)
}

/// Starting width for a branch: one byte when the opcode belongs to a
/// width family, its fixed width otherwise.
fn initial_branch_width(inst: &Instruction, table: &OpcodeTable) -> (u8, bool) {
    if family_member(inst, table, 1).is_some() {
        (1, false)
    } else {
        let width = table
            .get(inst.opcode)
            .map_or(1, |data| data.branch_len.max(1));
        (width, true)
    }
}

/// Finds the opcode encoding the same operation as `inst` with `width`
/// branch offset bytes, searching the adjacent table slots the width
/// families occupy.
fn family_member(inst: &Instruction, table: &OpcodeTable, width: u8) -> Option<u16> {
    let base = i32::from(inst.opcode);
    for candidate in (base - 2).max(0)..=base + 2 {
        let candidate = candidate as u16;
        if let Some(data) = table.get(candidate) {
            if data.name == inst.name && data.branch_len == width {
                return Some(candidate);
            }
        }
    }
    None
}

fn encoded_size(inst: &Instruction, branch_width: u8, bounds: &LiteralBoundaries) -> u32 {
    let mut size: u32 = if inst.opcode >= EXT_OPCODE_BASE { 2 } else { 1 };
    size += u32::from(branch_width);
    for lit in &inst.operands.literals {
        size += if lit.index < bounds.encoding_limit { 1 } else { 2 };
    }
    size
}

/// Absolute distance between the relocated branch site and its relocated
/// target.
fn branch_magnitude(
    inst: &Instruction,
    pos: usize,
    layouts: &[Layout],
    old_to_layout: &HashMap<u32, usize>,
    old_end: u32,
    new_end: u32,
) -> u32 {
    let old_target = inst.jump_target();

    let new_target = if old_target == old_end {
        new_end
    } else {
        match old_to_layout.get(&old_target) {
            Some(&target_pos) => layouts[target_pos].new_offset,
            None => panic!(
                "branch at {:#x} targets {:#x}, not a live instruction boundary",
                inst.offset, old_target
            ),
        }
    };

    layouts[pos].new_offset.abs_diff(new_target)
}

fn width_for(magnitude: u32) -> u8 {
    match magnitude {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        _ => 3,
    }
}

fn emit_opcode(
    bytes: &mut Vec<u8>,
    inst: &Instruction,
    layout: &Layout,
    table: &OpcodeTable,
) -> Result<()> {
    let opcode = if inst.is_jump() && !layout.fixed_width {
        match family_member(inst, table, layout.branch_width) {
            Some(member) => member,
            None => {
                return Err(malformed_error!(
                    "no {}-byte encoding of {} available",
                    layout.branch_width,
                    inst.name
                ))
            }
        }
    } else {
        inst.opcode
    };

    if opcode >= EXT_OPCODE_BASE {
        bytes.push(table.escape());
        bytes.push((opcode - EXT_OPCODE_BASE) as u8);
    } else {
        bytes.push(opcode as u8);
    }

    Ok(())
}

fn emit_branch(bytes: &mut Vec<u8>, magnitude: u32, width: u8) {
    for shift in (0..width).rev() {
        bytes.push((magnitude >> (8 * u32::from(shift))) as u8);
    }
}

fn emit_literal_index(bytes: &mut Vec<u8>, index: u16, bounds: &LiteralBoundaries) {
    if index < bounds.encoding_limit {
        bytes.push(index as u8);
    } else {
        let combined = index.wrapping_add(bounds.encoding_delta);
        bytes.push((combined >> 8) as u8);
        bytes.push(combined as u8);
    }
}

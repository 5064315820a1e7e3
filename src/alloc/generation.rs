//! Generation Table (component B)
//!
//! Byte-level accessors over the generation table placed at
//! `genesis.gen_table_offset` (see `crate::region::genesis`). Each slot
//! is a revocable capability counter: `table[alloc_id] == generation`
//! is the validity test a `TypedPtr` must pass before it is
//! dereferenced.

use crate::config::GEN_MAX;
use crate::error::{Result, SlsError};
use crate::layout::{read_u64, write_u64};
use crate::region::genesis::{GEN_TABLE_ENTRIES_OFF, GEN_TABLE_ENTRY_COUNT_OFF, GEN_TABLE_NEXT_GEN_OFF};
use crate::tri::Tri;

fn entry_offset(table_base: u64, alloc_id: u64) -> u64 {
    table_base + GEN_TABLE_ENTRIES_OFF + alloc_id * 8
}

pub fn entry_count(buf: &[u8], table_base: u64) -> Result<u64> {
    read_u64(buf, table_base + GEN_TABLE_ENTRY_COUNT_OFF)
}

fn set_entry_count(buf: &mut [u8], table_base: u64, value: u64) -> Result<()> {
    write_u64(buf, table_base + GEN_TABLE_ENTRY_COUNT_OFF, value)
}

pub fn next_generation(buf: &[u8], table_base: u64) -> Result<u64> {
    read_u64(buf, table_base + GEN_TABLE_NEXT_GEN_OFF)
}

fn set_next_generation(buf: &mut [u8], table_base: u64, value: u64) -> Result<()> {
    write_u64(buf, table_base + GEN_TABLE_NEXT_GEN_OFF, value)
}

/// Assign a fresh allocation identity. Returns `(alloc_id, generation)`
/// where `generation` is always the freshly persisted value `0`.
pub fn alloc_generation(buf: &mut [u8], table_base: u64) -> Result<(u64, u64)> {
    let id = next_generation(buf, table_base)?;
    if id as usize >= GEN_MAX {
        return Err(SlsError::Exhausted {
            resource: "generation table".into(),
            limit: GEN_MAX,
        });
    }
    set_next_generation(buf, table_base, id + 1)?;
    let count = entry_count(buf, table_base)?;
    if id >= count {
        set_entry_count(buf, table_base, id + 1)?;
    }
    write_u64(buf, entry_offset(table_base, id), 0)?;
    Ok((id, 0))
}

/// Increment the stored counter for `alloc_id`, invalidating every
/// outstanding capability that carries the prior generation. Returns
/// the new value.
pub fn revoke(buf: &mut [u8], table_base: u64, alloc_id: u64) -> Result<u64> {
    let count = entry_count(buf, table_base)?;
    if alloc_id >= count {
        return Err(SlsError::NotFound(format!(
            "no generation slot for alloc_id {alloc_id}"
        )));
    }
    let current = read_u64(buf, entry_offset(table_base, alloc_id))?;
    let next = current + 1;
    write_u64(buf, entry_offset(table_base, alloc_id), next)?;
    Ok(next)
}

/// `True` if `table[alloc_id] == generation`, `False` if it differs,
/// `Void` if `alloc_id` was never assigned.
pub fn check_generation(buf: &[u8], table_base: u64, alloc_id: u64, generation: u64) -> Result<Tri> {
    let count = entry_count(buf, table_base)?;
    if alloc_id >= count {
        return Ok(Tri::Void);
    }
    let current = read_u64(buf, entry_offset(table_base, alloc_id))?;
    Ok(Tri::from_bool(current == generation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::genesis::GEN_TABLE_SIZE;

    fn fresh_table() -> (Vec<u8>, u64) {
        let base = 0u64;
        let buf = vec![0u8; GEN_TABLE_SIZE as usize];
        (buf, base)
    }

    #[test]
    fn alloc_then_check_then_revoke() {
        let (mut buf, base) = fresh_table();
        let (id, g) = alloc_generation(&mut buf, base).unwrap();
        assert_eq!(g, 0);
        assert_eq!(check_generation(&buf, base, id, g).unwrap(), Tri::True);

        let newer = revoke(&mut buf, base, id).unwrap();
        assert_eq!(newer, 1);
        assert_eq!(check_generation(&buf, base, id, g).unwrap(), Tri::False);
        assert_eq!(check_generation(&buf, base, id, newer).unwrap(), Tri::True);
    }

    #[test]
    fn check_generation_void_when_unassigned() {
        let (buf, base) = fresh_table();
        assert_eq!(check_generation(&buf, base, 0, 0).unwrap(), Tri::Void);
    }

    #[test]
    fn ids_are_assigned_sequentially() {
        let (mut buf, base) = fresh_table();
        let (id_a, _) = alloc_generation(&mut buf, base).unwrap();
        let (id_b, _) = alloc_generation(&mut buf, base).unwrap();
        assert_eq!(id_a, 0);
        assert_eq!(id_b, 1);
    }
}

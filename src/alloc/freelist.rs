//! Free List (component B)
//!
//! A singly linked chain of freed blocks, inlined at the offsets they
//! occupy rather than tracked by any side index: the free list is a
//! chain of offsets inside the region's own byte buffer.
//!
//! Node layout, 24 bytes: `next_offset: u64`, `size: u64`,
//! `freed_generation: u64`.

use crate::error::Result;
use crate::layout::{read_u64, write_u64, VOID_OFFSET};

pub const NODE_SIZE: u64 = 24;
const OFF_NEXT: u64 = 0;
const OFF_SIZE: u64 = 8;
const OFF_FREED_GEN: u64 = 16;

fn read_next(buf: &[u8], node: u64) -> Result<u64> {
    read_u64(buf, node + OFF_NEXT)
}

fn write_next(buf: &mut [u8], node: u64, value: u64) -> Result<()> {
    write_u64(buf, node + OFF_NEXT, value)
}

fn read_size(buf: &[u8], node: u64) -> Result<u64> {
    read_u64(buf, node + OFF_SIZE)
}

fn write_size(buf: &mut [u8], node: u64, value: u64) -> Result<()> {
    write_u64(buf, node + OFF_SIZE, value)
}

fn write_freed_generation(buf: &mut [u8], node: u64, epoch: u64) -> Result<()> {
    write_u64(buf, node + OFF_FREED_GEN, epoch)
}

/// Push a newly freed block onto the list, optionally coalescing it
/// with an adjacent neighbor already on the list. Returns the new head
/// offset.
///
/// Coalescing is optional but enabled by default: it keeps the chain
/// from fragmenting into a long run of tiny nodes under churn. It
/// preserves acyclicity because a coalesced neighbor is unlinked
/// before the merged node is pushed.
pub fn push(
    buf: &mut [u8],
    head: u64,
    mut block_offset: u64,
    mut block_size: u64,
    epoch: u64,
    coalesce: bool,
) -> Result<u64> {
    let mut head = head;

    if coalesce {
        if let Some((merged_head, merged_size)) =
            unlink_adjacent(buf, head, block_offset, block_offset + block_size)?
        {
            head = merged_head.new_head;
            block_offset = merged_head.merged_offset;
            block_size = block_size + merged_size + merged_head.extra_size;
        }
    }

    write_next(buf, block_offset, head)?;
    write_size(buf, block_offset, block_size)?;
    write_freed_generation(buf, block_offset, epoch)?;
    Ok(block_offset)
}

struct MergeHead {
    new_head: u64,
    merged_offset: u64,
    extra_size: u64,
}

/// Scan the chain for a node whose range is adjacent to
/// `[block_offset, block_end)` on either side; if found, unlink it and
/// report the merged extent. Only merges with a single neighbor per
/// call — a second pass will pick up further merges on a later free.
fn unlink_adjacent(
    buf: &mut [u8],
    head: u64,
    block_offset: u64,
    block_end: u64,
) -> Result<Option<(MergeHead, u64)>> {
    let mut prev: Option<u64> = None;
    let mut cur = head;
    let mut steps = 0u64;
    let max_steps = 1 << 20;

    while cur != VOID_OFFSET {
        steps += 1;
        if steps > max_steps {
            break;
        }
        let size = read_size(buf, cur)?;
        let next = read_next(buf, cur)?;
        let end = cur + size;

        let adjacent_after = end == block_offset;
        let adjacent_before = block_end == cur;

        if adjacent_after || adjacent_before {
            let new_head = match prev {
                Some(p) => {
                    write_next(buf, p, next)?;
                    head
                }
                None => next,
            };
            let merged_offset = if adjacent_after { cur } else { block_offset };
            return Ok(Some((
                MergeHead {
                    new_head,
                    merged_offset,
                    extra_size: 0,
                },
                size,
            )));
        }

        prev = Some(cur);
        cur = next;
    }

    Ok(None)
}

/// First-fit scan: find the first node whose size is at least
/// `requested`, unlink it, and return `(node_offset, node_size,
/// new_head)`.
pub fn pop_first_fit(buf: &mut [u8], head: u64, requested: u64) -> Result<Option<(u64, u64, u64)>> {
    let mut prev: Option<u64> = None;
    let mut cur = head;
    let mut steps = 0u64;
    let max_steps = 1 << 20;

    while cur != VOID_OFFSET {
        steps += 1;
        if steps > max_steps {
            return Ok(None);
        }
        let size = read_size(buf, cur)?;
        let next = read_next(buf, cur)?;

        if size >= requested {
            let new_head = match prev {
                Some(p) => {
                    write_next(buf, p, next)?;
                    head
                }
                None => next,
            };
            return Ok(Some((cur, size, new_head)));
        }

        prev = Some(cur);
        cur = next;
    }

    Ok(None)
}

/// Walk the full chain, counting nodes; used by tests and by P2
/// ("free-list traversal terminates") style sanity checks. Errors if a
/// cycle is suspected (walk exceeds `bound` steps).
pub fn walk_len(buf: &[u8], head: u64, bound: u64) -> Result<u64> {
    let mut cur = head;
    let mut count = 0u64;
    while cur != VOID_OFFSET {
        count += 1;
        if count > bound {
            return Err(crate::error::SlsError::CycleDetected(cur));
        }
        cur = read_next(buf, cur)?;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_pop_first_fit() {
        let mut buf = vec![0u8; 4096];
        let head = push(&mut buf, VOID_OFFSET, 256, 64, 1, false).unwrap();
        let (node, size, new_head) = pop_first_fit(&mut buf, head, 32).unwrap().unwrap();
        assert_eq!(node, 256);
        assert_eq!(size, 64);
        assert_eq!(new_head, VOID_OFFSET);
    }

    #[test]
    fn pop_first_fit_skips_too_small_nodes() {
        let mut buf = vec![0u8; 4096];
        let head = push(&mut buf, VOID_OFFSET, 256, 16, 1, false).unwrap();
        let head = push(&mut buf, head, 512, 128, 1, false).unwrap();
        let (node, size, _) = pop_first_fit(&mut buf, head, 100).unwrap().unwrap();
        assert_eq!(node, 512);
        assert_eq!(size, 128);
    }

    #[test]
    fn coalesces_adjacent_blocks() {
        let mut buf = vec![0u8; 4096];
        let head = push(&mut buf, VOID_OFFSET, 1024, 128, 1, true).unwrap();
        // block at 1152 is adjacent right after the first (1024+128=1152)
        let head = push(&mut buf, head, 1152, 64, 2, true).unwrap();
        let (_, size, _) = pop_first_fit(&mut buf, head, 1).unwrap().unwrap();
        assert_eq!(size, 192);
    }

    #[test]
    fn walk_len_counts_nodes() {
        let mut buf = vec![0u8; 4096];
        let head = push(&mut buf, VOID_OFFSET, 256, 16, 1, false).unwrap();
        let head = push(&mut buf, head, 512, 16, 1, false).unwrap();
        assert_eq!(walk_len(&buf, head, 100).unwrap(), 2);
    }
}

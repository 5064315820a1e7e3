//! Invariants: Declarative Per-Field Constraints
//!
//! Each semantic type carries an ordered list of these. Custom
//! validation/recovery is modeled as a tagged variant carrying a
//! polymorphic callback pair, matching the redesign note for
//! "Callbacks for custom validation / recovery": the callback's
//! captured state lives behind an owned, well-typed `user_data` handle
//! rather than a raw context pointer.

use crate::error::{Result, SlsError};
use crate::layout::{read_int_sized, read_uint_sized, write_int_sized, write_uint_sized, VOID_OFFSET};
use crate::region::Region;
use std::sync::Arc;

/// A custom validator: given the instance bytes and the invariant's
/// `user_data`, return `Ok(())` or a descriptive failure.
pub type CustomValidator =
    Arc<dyn Fn(&[u8], Option<&(dyn std::any::Any + Send + Sync)>) -> Result<()> + Send + Sync>;

/// A custom recovery hook: given mutable instance bytes and
/// `user_data`, attempt a repair and report whether it succeeded.
pub type CustomRecovery = Arc<
    dyn Fn(&mut [u8], Option<&(dyn std::any::Any + Send + Sync)>) -> Result<bool> + Send + Sync,
>;

/// One invariant kind a semantic type's field can carry.
pub enum InvariantKind {
    /// The pointer-sized field must not be the void sentinel.
    NotNullPtr,
    /// The pointer-sized field may be void; if not, it must lie inside
    /// the region.
    NullablePtr,
    /// Walking `next`-links starting at the entry's own offset must
    /// not cycle. `next_offset` is the byte offset, within each node,
    /// of its own next-pointer field.
    NoCycle { next_offset: u64 },
    /// The count field (described by the invariant's `field_offset`/
    /// `field_size`) must not exceed `max_count` (when nonzero) and
    /// `count * elem_size` must not exceed the entry's `alloc_size`.
    ArrayBounds { elem_size: u64, max_count: u64 },
    /// The signed integer field must be `>= min`, and `>= 1` if
    /// `live_only`.
    Refcount { min: i64, live_only: bool },
    /// The signed integer field must lie in `[min, max]`.
    Range { min: i64, max: i64 },
    /// User-supplied validation/recovery.
    Custom {
        validator: CustomValidator,
        recovery: Option<CustomRecovery>,
        user_data: Option<Arc<dyn std::any::Any + Send + Sync>>,
    },
}

/// A single declared invariant on a semantic type.
pub struct Invariant {
    pub kind: InvariantKind,
    pub field_offset: u64,
    pub field_size: u64,
    pub description: String,
    pub auto_recoverable: bool,
}

impl Invariant {
    pub fn new(
        kind: InvariantKind,
        field_offset: u64,
        field_size: u64,
        description: impl Into<String>,
        auto_recoverable: bool,
    ) -> Self {
        Self {
            kind,
            field_offset,
            field_size,
            description: description.into(),
            auto_recoverable,
        }
    }

    /// Whether `recover` has any chance of fixing a failure of this
    /// invariant. `NotNullPtr` is never auto-recoverable regardless of
    /// the flag the caller set.
    pub fn recoverable(&self) -> bool {
        self.auto_recoverable && !matches!(self.kind, InvariantKind::NotNullPtr)
    }
}

/// Validate one invariant against the instance at `(entry_ptr,
/// alloc_size)` inside `region`.
pub fn check(region: &Region, entry_ptr: u64, alloc_size: u64, inv: &Invariant) -> Result<()> {
    let field_off = entry_ptr + inv.field_offset;
    match &inv.kind {
        InvariantKind::NotNullPtr => {
            let value = read_uint_sized(region.as_bytes(), field_off, inv.field_size.max(8))?;
            if value == VOID_OFFSET {
                return Err(SlsError::NullViolation(field_off));
            }
            Ok(())
        }
        InvariantKind::NullablePtr => {
            let value = read_uint_sized(region.as_bytes(), field_off, inv.field_size.max(8))?;
            if value == VOID_OFFSET {
                return Ok(());
            }
            if value >= region.len() {
                return Err(SlsError::Invalid(format!(
                    "nullable pointer at {field_off:#x} holds out-of-range offset {value:#x}"
                )));
            }
            Ok(())
        }
        InvariantKind::NoCycle { next_offset } => check_no_cycle(region, entry_ptr, *next_offset),
        InvariantKind::ArrayBounds { elem_size, max_count } => {
            let count = read_uint_sized(region.as_bytes(), field_off, inv.field_size)?;
            if *max_count != 0 && count > *max_count {
                return Err(SlsError::BoundsExceeded {
                    count,
                    elem_size: *elem_size,
                    alloc_size,
                });
            }
            if count.saturating_mul(*elem_size) > alloc_size {
                return Err(SlsError::BoundsExceeded {
                    count,
                    elem_size: *elem_size,
                    alloc_size,
                });
            }
            Ok(())
        }
        InvariantKind::Refcount { min, live_only } => {
            let value = read_int_sized(region.as_bytes(), field_off, inv.field_size)?;
            if value < *min || (*live_only && value < 1) {
                return Err(SlsError::RefcountInvalid { value, min: *min });
            }
            Ok(())
        }
        InvariantKind::Range { min, max } => {
            let value = read_int_sized(region.as_bytes(), field_off, inv.field_size)?;
            if value < *min || value > *max {
                return Err(SlsError::RangeExceeded {
                    value,
                    min: *min,
                    max: *max,
                });
            }
            Ok(())
        }
        InvariantKind::Custom {
            validator,
            user_data,
            ..
        } => {
            let bytes = region
                .as_bytes()
                .get(entry_ptr as usize..(entry_ptr + alloc_size) as usize)
                .ok_or_else(|| SlsError::Invalid("custom validator: entry out of range".into()))?;
            validator(bytes, user_data.as_ref().map(|a| a.as_ref())).map_err(|e| {
                SlsError::CustomFailed(format!("{} failed: {e}", inv.description))
            })
        }
    }
}

/// Floyd's tortoise-and-hare, starting at `entry_ptr` itself, capped at
/// 65536 steps.
fn check_no_cycle(region: &Region, entry_ptr: u64, next_offset: u64) -> Result<()> {
    const MAX_DEPTH: u64 = 65536;

    let read_next = |node: u64| -> Result<u64> { read_uint_sized(region.as_bytes(), node + next_offset, 8) };

    let mut slow = entry_ptr;
    let mut fast = entry_ptr;
    let mut steps = 0u64;

    loop {
        let next_fast = read_next(fast)?;
        if next_fast == VOID_OFFSET {
            return Ok(());
        }
        let next_fast2 = read_next(next_fast)?;
        if next_fast2 == VOID_OFFSET {
            return Ok(());
        }
        slow = read_next(slow)?;
        fast = next_fast2;
        steps += 1;

        if slow == fast {
            return Err(SlsError::CycleDetected(entry_ptr));
        }
        if steps > MAX_DEPTH {
            return Ok(());
        }
    }
}

/// Attempt to repair one failed invariant in place. Returns whether the
/// repair was applied (not whether re-validation will now pass).
pub fn recover(
    region: &mut Region,
    entry_ptr: u64,
    alloc_size: u64,
    inv: &Invariant,
) -> Result<bool> {
    if !inv.recoverable() {
        return Ok(false);
    }
    let field_off = entry_ptr + inv.field_offset;

    match &inv.kind {
        InvariantKind::NullablePtr => {
            let slice = region
                .offset_to_slice_mut(field_off, inv.field_size.max(8))?
                .ok_or_else(|| SlsError::Invalid("recover: void field".into()))?;
            write_uint_sized(slice, 0, inv.field_size.max(8), VOID_OFFSET)?;
            Ok(true)
        }
        InvariantKind::NoCycle { next_offset } => {
            let slice = region
                .offset_to_slice_mut(entry_ptr + next_offset, 8)?
                .ok_or_else(|| SlsError::Invalid("recover: void next pointer".into()))?;
            write_uint_sized(slice, 0, 8, VOID_OFFSET)?;
            Ok(true)
        }
        InvariantKind::ArrayBounds { elem_size, max_count } => {
            let cap = if *max_count != 0 {
                (*max_count).min(alloc_size / elem_size.max(&1))
            } else {
                alloc_size / elem_size.max(&1)
            };
            let slice = region
                .offset_to_slice_mut(field_off, inv.field_size)?
                .ok_or_else(|| SlsError::Invalid("recover: void count field".into()))?;
            write_uint_sized(slice, 0, inv.field_size, cap)?;
            Ok(true)
        }
        InvariantKind::Refcount { min, live_only } => {
            let value = if *live_only { 1 } else { *min };
            let slice = region
                .offset_to_slice_mut(field_off, inv.field_size)?
                .ok_or_else(|| SlsError::Invalid("recover: void refcount field".into()))?;
            write_int_sized(slice, 0, inv.field_size, value)?;
            Ok(true)
        }
        InvariantKind::Range { min, max } => {
            let current = read_int_sized(region.as_bytes(), field_off, inv.field_size)?;
            let clamped = current.clamp(*min, *max);
            let slice = region
                .offset_to_slice_mut(field_off, inv.field_size)?
                .ok_or_else(|| SlsError::Invalid("recover: void range field".into()))?;
            write_int_sized(slice, 0, inv.field_size, clamped)?;
            Ok(true)
        }
        InvariantKind::Custom {
            recovery,
            user_data,
            ..
        } => {
            let Some(recovery) = recovery else {
                return Ok(false);
            };
            let slice = region
                .offset_to_slice_mut(entry_ptr, alloc_size)?
                .ok_or_else(|| SlsError::Invalid("recover: custom entry out of range".into()))?;
            recovery(slice, user_data.as_ref().map(|a| a.as_ref()))
        }
        InvariantKind::NotNullPtr => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::write_u64;
    use tempfile::NamedTempFile;

    fn open_region() -> (Region, std::path::PathBuf) {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();
        drop(tmp);
        (Region::create(&path, 1 << 20).unwrap(), path)
    }

    #[test]
    fn not_null_ptr_fails_on_void() {
        let (mut region, path) = open_region();
        write_u64(region.as_bytes_mut(), 4096, VOID_OFFSET).unwrap();
        let inv = Invariant::new(InvariantKind::NotNullPtr, 0, 8, "must be set", false);
        assert!(matches!(
            check(&region, 4096, 8, &inv),
            Err(SlsError::NullViolation(_))
        ));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn no_cycle_detects_three_node_loop() {
        let (mut region, path) = open_region();
        // A -> B -> C -> A, each node is 8 bytes holding its next offset.
        write_u64(region.as_bytes_mut(), 4096, 4104).unwrap(); // A -> B
        write_u64(region.as_bytes_mut(), 4104, 4112).unwrap(); // B -> C
        write_u64(region.as_bytes_mut(), 4112, 4096).unwrap(); // C -> A
        let inv = Invariant::new(InvariantKind::NoCycle { next_offset: 0 }, 0, 8, "acyclic", true);
        assert!(matches!(
            check(&region, 4096, 8, &inv),
            Err(SlsError::CycleDetected(_))
        ));

        recover(&mut region, 4096, 8, &inv).unwrap();
        assert!(check(&region, 4096, 8, &inv).is_ok());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn range_recovers_by_clamping() {
        let (mut region, path) = open_region();
        write_u64(region.as_bytes_mut(), 4096, 250u64).unwrap();
        let inv = Invariant::new(
            InvariantKind::Range { min: 0, max: 100 },
            0,
            8,
            "bounded value",
            true,
        );
        assert!(matches!(
            check(&region, 4096, 8, &inv),
            Err(SlsError::RangeExceeded { .. })
        ));
        recover(&mut region, 4096, 8, &inv).unwrap();
        assert!(check(&region, 4096, 8, &inv).is_ok());
        let value = read_int_sized(region.as_bytes(), 4096, 8).unwrap();
        assert_eq!(value, 100);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn array_bounds_rejects_oversized_count() {
        let (mut region, path) = open_region();
        write_u64(region.as_bytes_mut(), 4096, 20u64).unwrap();
        let inv = Invariant::new(
            InvariantKind::ArrayBounds {
                elem_size: 8,
                max_count: 4,
            },
            0,
            8,
            "bounded array",
            true,
        );
        assert!(matches!(
            check(&region, 4096, 64, &inv),
            Err(SlsError::BoundsExceeded { .. })
        ));
        recover(&mut region, 4096, 64, &inv).unwrap();
        assert!(check(&region, 4096, 64, &inv).is_ok());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn not_null_ptr_is_never_auto_recoverable() {
        let inv = Invariant::new(InvariantKind::NotNullPtr, 0, 8, "must be set", true);
        assert!(!inv.recoverable());
    }
}

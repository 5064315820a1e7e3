//! Semantic Checkpoint Engine (component E)
//!
//! Where the transaction and snapshot engines guarantee the region's
//! bytes are internally consistent, the checkpoint engine asks whether
//! they mean what the application thinks they mean: that a typed
//! instance's declared invariants still hold. Types are generalized
//! from a fixed instance shape to an arbitrary caller-registered one,
//! with CRC32 fingerprinting supplied by `crc32fast`.
//!
//! Kept as an in-memory structure layered over the region rather than
//! literally housed inside it (see DESIGN.md's Open Question record):
//! a checkpoint only makes sense against the type registry that
//! produced it, and that registry is itself process-local.

pub mod invariant;
pub mod registry;

use crate::error::{Result, SlsError};
use crate::region::Region;
use invariant::{check, recover};
use registry::TypeRegistry;

/// One instance tracked by a checkpoint: its type, its location, and
/// the fingerprint taken when it was added.
pub struct CheckpointEntry {
    pub type_id: u64,
    pub entry_ptr: u64,
    pub alloc_size: u64,
    fingerprint: u32,
}

/// The outcome of validating a single entry.
pub struct EntryReport {
    pub entry_ptr: u64,
    pub type_id: u64,
    /// Invariant failures, in declaration order.
    pub failures: Vec<SlsError>,
    /// Whether the stored CRC32 still matches the instance bytes.
    pub fingerprint_mismatch: bool,
}

impl EntryReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty() && !self.fingerprint_mismatch
    }
}

/// A named point-in-time set of tracked instances.
pub struct Checkpoint {
    pub name: String,
    pub taken_at: u64,
    entries: Vec<CheckpointEntry>,
}

impl Checkpoint {
    pub fn entries(&self) -> &[CheckpointEntry] {
        &self.entries
    }
}

fn fingerprint(region: &Region, entry_ptr: u64, alloc_size: u64) -> Result<u32> {
    let bytes = region
        .as_bytes()
        .get(entry_ptr as usize..(entry_ptr + alloc_size) as usize)
        .ok_or_else(|| SlsError::Invalid("fingerprint: entry out of range".into()))?;
    Ok(crc32fast::hash(bytes))
}

/// Owns the type registry and the checkpoints taken against it.
pub struct CheckpointEngine {
    registry: TypeRegistry,
    checkpoints: Vec<Checkpoint>,
}

impl CheckpointEngine {
    pub fn new() -> Self {
        Self {
            registry: TypeRegistry::new(),
            checkpoints: Vec::new(),
        }
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut TypeRegistry {
        &mut self.registry
    }

    /// Start a new checkpoint under `name`, stamped with the region's
    /// current logical time.
    pub fn create(&mut self, name: impl Into<String>, region: &Region) -> usize {
        self.checkpoints.push(Checkpoint {
            name: name.into(),
            taken_at: region.logical_time(),
            entries: Vec::new(),
        });
        self.checkpoints.len() - 1
    }

    /// Add one tracked instance to an open checkpoint, fingerprinting
    /// its current bytes.
    pub fn add_entry(
        &mut self,
        checkpoint_idx: usize,
        region: &Region,
        type_id: u64,
        entry_ptr: u64,
        alloc_size: u64,
    ) -> Result<()> {
        self.registry.get(type_id)?;
        let fp = fingerprint(region, entry_ptr, alloc_size)?;
        let checkpoint = self
            .checkpoints
            .get_mut(checkpoint_idx)
            .ok_or_else(|| SlsError::NotFound(format!("checkpoint index {checkpoint_idx}")))?;
        checkpoint.entries.push(CheckpointEntry {
            type_id,
            entry_ptr,
            alloc_size,
            fingerprint: fp,
        });
        Ok(())
    }

    /// Validate every entry in a checkpoint: per-field invariants, any
    /// whole-instance validator, and the stored fingerprint.
    pub fn validate(&self, checkpoint_idx: usize, region: &Region) -> Result<Vec<EntryReport>> {
        let checkpoint = self
            .checkpoints
            .get(checkpoint_idx)
            .ok_or_else(|| SlsError::NotFound(format!("checkpoint index {checkpoint_idx}")))?;

        let mut reports = Vec::with_capacity(checkpoint.entries.len());
        for entry in &checkpoint.entries {
            let ty = self.registry.get(entry.type_id)?;
            let mut failures = Vec::new();

            for inv in &ty.invariants {
                if let Err(e) = check(region, entry.entry_ptr, entry.alloc_size, inv) {
                    failures.push(e);
                }
            }

            if let Some(validator) = &ty.validator {
                if let Some(bytes) = region.as_bytes().get(
                    entry.entry_ptr as usize..(entry.entry_ptr + entry.alloc_size) as usize,
                ) {
                    if let Err(e) = validator(bytes) {
                        failures.push(e);
                    }
                }
            }

            let current_fp = fingerprint(region, entry.entry_ptr, entry.alloc_size)?;
            reports.push(EntryReport {
                entry_ptr: entry.entry_ptr,
                type_id: entry.type_id,
                failures,
                fingerprint_mismatch: current_fp != entry.fingerprint,
            });
        }
        Ok(reports)
    }

    /// Attempt to repair every auto-recoverable failure reported by
    /// [`validate`], then re-validate. Entries whose type carries an
    /// instance-level recovery hook get that hook run after field
    /// repairs: field repairs first, then whole-instance recovery.
    pub fn recover(
        &mut self,
        checkpoint_idx: usize,
        region: &mut Region,
    ) -> Result<Vec<EntryReport>> {
        let entry_specs: Vec<(u64, u64, u64)> = {
            let checkpoint = self
                .checkpoints
                .get(checkpoint_idx)
                .ok_or_else(|| SlsError::NotFound(format!("checkpoint index {checkpoint_idx}")))?;
            checkpoint
                .entries
                .iter()
                .map(|e| (e.type_id, e.entry_ptr, e.alloc_size))
                .collect()
        };

        for (type_id, entry_ptr, alloc_size) in entry_specs {
            let ty = self.registry.get(type_id)?;
            for inv in &ty.invariants {
                if check(region, entry_ptr, alloc_size, inv).is_err() {
                    let _ = recover(region, entry_ptr, alloc_size, inv);
                }
            }

            if let Some(recovery) = &ty.recovery {
                if let Some(slice) = region.offset_to_slice_mut(entry_ptr, alloc_size)? {
                    let _ = recovery(slice);
                }
            }
        }

        // Fingerprints are intentionally left stale after recovery:
        // they record the state at checkpoint time, and a mismatch
        // after repair is expected and informative, not a bug.
        self.validate(checkpoint_idx, region)
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }
}

impl Default for CheckpointEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::write_u64;
    use invariant::{Invariant, InvariantKind};
    use tempfile::NamedTempFile;

    fn open_region() -> (Region, std::path::PathBuf) {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();
        drop(tmp);
        (Region::create(&path, 1 << 20).unwrap(), path)
    }

    #[test]
    fn validate_reports_field_failures() {
        let (mut region, path) = open_region();
        write_u64(region.as_bytes_mut(), 4096, 200u64).unwrap();

        let mut engine = CheckpointEngine::new();
        let type_id = engine.registry_mut().register_type("Counter", 8).unwrap();
        engine
            .registry_mut()
            .add_invariant(
                type_id,
                Invariant::new(InvariantKind::Range { min: 0, max: 100 }, 0, 8, "bounded", true),
            )
            .unwrap();

        let cp = engine.create("cp1", &region);
        engine.add_entry(cp, &region, type_id, 4096, 8).unwrap();

        let report = &engine.validate(cp, &region).unwrap()[0];
        assert!(!report.is_ok());
        assert_eq!(report.failures.len(), 1);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn recover_fixes_range_violation() {
        let (mut region, path) = open_region();
        write_u64(region.as_bytes_mut(), 4096, 200u64).unwrap();

        let mut engine = CheckpointEngine::new();
        let type_id = engine.registry_mut().register_type("Counter", 8).unwrap();
        engine
            .registry_mut()
            .add_invariant(
                type_id,
                Invariant::new(InvariantKind::Range { min: 0, max: 100 }, 0, 8, "bounded", true),
            )
            .unwrap();

        let cp = engine.create("cp1", &region);
        engine.add_entry(cp, &region, type_id, 4096, 8).unwrap();

        let reports = engine.recover(cp, &mut region).unwrap();
        assert!(reports[0].failures.is_empty());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn fingerprint_mismatch_detected_after_external_write() {
        let (mut region, path) = open_region();
        write_u64(region.as_bytes_mut(), 4096, 7u64).unwrap();

        let mut engine = CheckpointEngine::new();
        let type_id = engine.registry_mut().register_type("Plain", 8).unwrap();
        let cp = engine.create("cp1", &region);
        engine.add_entry(cp, &region, type_id, 4096, 8).unwrap();

        write_u64(region.as_bytes_mut(), 4096, 9u64).unwrap();
        let report = &engine.validate(cp, &region).unwrap()[0];
        assert!(report.fingerprint_mismatch);
        std::fs::remove_file(&path).ok();
    }
}

//! Type Registry (component E, process-wide)
//!
//! A small, append-only catalogue of semantic types: up to `TYPE_MAX`
//! entries, each with an ordered list of invariants and optional
//! whole-instance validator/recovery hooks, generalized from tagged
//! metadata describing a single fixed instance shape to an arbitrary
//! caller-declared one, encapsulating the type table as an explicitly
//! constructed registry rather than an ambient global.

use super::invariant::Invariant;
use crate::config::{INVARIANTS_PER_TYPE_MAX, TYPE_MAX};
use crate::error::{Result, SlsError};
use indexmap::IndexMap;
use std::sync::Arc;

/// An instance-level validator, run after all per-field invariants.
pub type InstanceValidator = Arc<dyn Fn(&[u8]) -> Result<()> + Send + Sync>;

/// An instance-level recovery hook, returning whether it repaired the
/// instance.
pub type InstanceRecovery = Arc<dyn Fn(&mut [u8]) -> Result<bool> + Send + Sync>;

/// A registered semantic type.
pub struct SemanticType {
    pub type_id: u64,
    pub name: String,
    pub instance_size: u64,
    pub invariants: Vec<Invariant>,
    pub validator: Option<InstanceValidator>,
    pub recovery: Option<InstanceRecovery>,
}

/// Process-wide, or explicitly owned rather than ambient, catalogue of
/// semantic types. Backed by an `IndexMap` keyed on `type_id` so
/// lookup by id is O(1) while `iter`/`find_type` still walk types in
/// registration order, matching `list_snapshots`' same ordering
/// guarantee over `SnapshotTable`.
pub struct TypeRegistry {
    types: IndexMap<u64, SemanticType>,
    next_id: u64,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            types: IndexMap::new(),
            next_id: 0,
        }
    }

    pub fn register_type(&mut self, name: impl Into<String>, instance_size: u64) -> Result<u64> {
        if self.types.len() >= TYPE_MAX {
            return Err(SlsError::Exhausted {
                resource: "semantic types".into(),
                limit: TYPE_MAX,
            });
        }
        let type_id = self.next_id;
        self.next_id += 1;
        self.types.insert(
            type_id,
            SemanticType {
                type_id,
                name: name.into(),
                instance_size,
                invariants: Vec::new(),
                validator: None,
                recovery: None,
            },
        );
        Ok(type_id)
    }

    pub fn add_invariant(&mut self, type_id: u64, inv: Invariant) -> Result<()> {
        let ty = self.type_mut(type_id)?;
        if ty.invariants.len() >= INVARIANTS_PER_TYPE_MAX {
            return Err(SlsError::Exhausted {
                resource: format!("invariants for type {type_id}"),
                limit: INVARIANTS_PER_TYPE_MAX,
            });
        }
        ty.invariants.push(inv);
        Ok(())
    }

    pub fn set_type_validator(
        &mut self,
        type_id: u64,
        validator: Option<InstanceValidator>,
        recovery: Option<InstanceRecovery>,
    ) -> Result<()> {
        let ty = self.type_mut(type_id)?;
        ty.validator = validator;
        ty.recovery = recovery;
        Ok(())
    }

    pub fn find_type(&self, name: &str) -> Option<&SemanticType> {
        self.types.values().find(|t| t.name == name)
    }

    pub fn get(&self, type_id: u64) -> Result<&SemanticType> {
        self.types
            .get(&type_id)
            .ok_or_else(|| SlsError::NotFound(format!("type id {type_id}")))
    }

    fn type_mut(&mut self, type_id: u64) -> Result<&mut SemanticType> {
        self.types
            .get_mut(&type_id)
            .ok_or_else(|| SlsError::NotFound(format!("type id {type_id}")))
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::invariant::{Invariant, InvariantKind};

    #[test]
    fn register_then_find_by_name() {
        let mut reg = TypeRegistry::new();
        let id = reg.register_type("Node", 32).unwrap();
        assert_eq!(reg.find_type("Node").unwrap().type_id, id);
        assert!(reg.find_type("Missing").is_none());
    }

    #[test]
    fn add_invariant_appends_in_order() {
        let mut reg = TypeRegistry::new();
        let id = reg.register_type("Node", 32).unwrap();
        reg.add_invariant(
            id,
            Invariant::new(InvariantKind::NotNullPtr, 0, 8, "ptr must be set", false),
        )
        .unwrap();
        reg.add_invariant(
            id,
            Invariant::new(InvariantKind::Range { min: 0, max: 10 }, 8, 4, "bounded", true),
        )
        .unwrap();
        assert_eq!(reg.get(id).unwrap().invariants.len(), 2);
    }

    #[test]
    fn rejects_invariants_past_per_type_limit() {
        let mut reg = TypeRegistry::new();
        let id = reg.register_type("Node", 32).unwrap();
        for _ in 0..INVARIANTS_PER_TYPE_MAX {
            reg.add_invariant(
                id,
                Invariant::new(InvariantKind::NotNullPtr, 0, 8, "x", false),
            )
            .unwrap();
        }
        assert!(reg
            .add_invariant(id, Invariant::new(InvariantKind::NotNullPtr, 0, 8, "x", false))
            .is_err());
    }

    #[test]
    fn rejects_types_past_registry_limit() {
        let mut reg = TypeRegistry::new();
        for i in 0..TYPE_MAX {
            reg.register_type(format!("T{i}"), 8).unwrap();
        }
        assert!(reg.register_type("Overflow", 8).is_err());
    }
}

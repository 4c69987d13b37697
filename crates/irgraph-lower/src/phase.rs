//! The lowering phase interface.
//!
//! A phase gets a [`PhaseContext`] for the duration of one run. Temporary
//! property tokens acquired from the context are valid only until the run
//! ends, whether it succeeds or fails.

use irgraph_core::{Database, DynamicPropertyKey, ElementId, KindId, PhaseLifetime, TemporaryToken};

use crate::error::LowerError;

/// One transformation pass over a compilation unit.
pub trait LoweringPhase {
    /// Stable name, used in logs, configuration and token diagnostics.
    fn name(&self) -> &str;

    fn lower(&mut self, ctx: &mut PhaseContext<'_>) -> Result<(), LowerError>;
}

/// Access to the compilation unit for one phase run.
pub struct PhaseContext<'a> {
    db: &'a mut Database,
    lifetime: PhaseLifetime,
    include_external_modules: bool,
}

impl<'a> PhaseContext<'a> {
    pub(crate) fn new(db: &'a mut Database, lifetime: PhaseLifetime, include_external_modules: bool) -> Self {
        PhaseContext {
            db,
            lifetime,
            include_external_modules,
        }
    }

    pub fn database(&mut self) -> &mut Database {
        self.db
    }

    pub fn phase(&self) -> &str {
        self.lifetime.phase()
    }

    /// All indexed elements of `kind` in the compiled unit, followed by those
    /// of the external modules when `include_external` is set.
    ///
    /// The result is collected up front so the phase can edit the tree while
    /// walking it.
    pub fn all_elements_of_kind(&mut self, kind: KindId, include_external: bool) -> Result<Vec<ElementId>, LowerError> {
        let elements = if include_external {
            self.db.get_elements_with_index_including_external(kind)?.collect()
        } else {
            self.db.get_elements_with_index(kind)?.collect()
        };
        Ok(elements)
    }

    /// [`all_elements_of_kind`](Self::all_elements_of_kind) with the
    /// pipeline's default for external modules.
    pub fn elements_of_kind(&mut self, kind: KindId) -> Result<Vec<ElementId>, LowerError> {
        let include = self.include_external_modules;
        self.all_elements_of_kind(kind, include)
    }

    /// A token for `key` that stops working when this phase run ends.
    pub fn acquire_temporary_property<T>(&self, key: &DynamicPropertyKey<T>) -> TemporaryToken<T> {
        self.lifetime.token(key)
    }

    /// Builds a [`LowerError::PhaseFailed`] for this phase.
    pub fn fail(&self, message: impl Into<String>) -> LowerError {
        LowerError::PhaseFailed {
            phase: self.phase().to_string(),
            message: message.into(),
        }
    }
}

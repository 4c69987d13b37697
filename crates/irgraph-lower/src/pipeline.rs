//! Sequential phase pipeline.
//!
//! Phases run one after another over a single database. Each run gets a
//! fresh [`PhaseLifetime`] that is ended when the run returns, so temporary
//! properties from one phase are never visible to the next.

use irgraph_core::{Database, PhaseLifetime};

use crate::config::PipelineConfig;
use crate::error::LowerError;
use crate::phase::{LoweringPhase, PhaseContext};

/// Ends a phase lifetime on drop, including on early error returns.
struct LifetimeGuard(PhaseLifetime);

impl Drop for LifetimeGuard {
    fn drop(&mut self) {
        self.0.end();
    }
}

/// What a pipeline run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    /// Phases that ran, in order.
    pub ran: Vec<String>,
    /// Phases skipped by configuration.
    pub skipped: Vec<String>,
}

/// An ordered list of lowering phases.
pub struct Pipeline {
    config: PipelineConfig,
    phases: Vec<Box<dyn LoweringPhase>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Pipeline {
            config,
            phases: Vec::new(),
        }
    }

    pub fn add_phase(&mut self, phase: impl LoweringPhase + 'static) -> &mut Self {
        self.phases.push(Box::new(phase));
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn phase_names(&self) -> impl Iterator<Item = &str> {
        self.phases.iter().map(|phase| phase.name())
    }

    /// Runs every enabled phase over `db`. Stops at the first failure.
    pub fn run(&mut self, db: &mut Database) -> Result<PipelineReport, LowerError> {
        tracing::info!(
            db = %db.id(),
            name = db.name(),
            phases = self.phases.len(),
            external_modules = db.external_modules().len(),
            "running lowering pipeline"
        );

        let mut report = PipelineReport::default();
        for phase in &mut self.phases {
            let name = phase.name().to_string();
            if self.config.is_disabled(&name) {
                tracing::debug!(phase = %name, "phase disabled");
                report.skipped.push(name);
                continue;
            }

            let span = tracing::info_span!("phase", name = %name);
            let _entered = span.enter();

            let guard = LifetimeGuard(PhaseLifetime::begin(name.clone()));
            let mut ctx = PhaseContext::new(db, guard.0.clone(), self.config.include_external_modules);
            if let Err(err) = phase.lower(&mut ctx) {
                tracing::warn!(error = %err, "phase failed");
                return Err(err);
            }
            drop(guard);

            if self.config.verify_after_each_phase {
                db.realize_tree_movements()?;
                db.verify_consistency()?;
            }
            tracing::debug!(pending_movements = db.pending_movements(), "phase finished");
            report.ran.push(name);
        }
        Ok(report)
    }
}

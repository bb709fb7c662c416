//! Auto-save of finalized runs into the active session.

use std::path::Path;

use tracing::warn;

use super::session::SessionWriter;
use crate::store::run::Run;

/// What happened to a run's export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Disabled,
    Saved,
    Failed,
}

/// Exports finalized runs until the first failure, then stays off.
///
/// Saving does blocking file IO; callers keep it off the async workers.
#[derive(Debug, Default)]
pub struct AutoSave {
    writer: Option<SessionWriter>,
}

impl AutoSave {
    pub fn new(writer: SessionWriter) -> Self {
        Self {
            writer: Some(writer),
        }
    }

    pub fn enabled(&self) -> bool {
        self.writer.is_some()
    }

    pub fn dir(&self) -> Option<&Path> {
        self.writer.as_ref().map(SessionWriter::dir)
    }

    pub fn save(&mut self, run: &Run) -> PersistOutcome {
        let Some(writer) = self.writer.as_mut() else {
            return PersistOutcome::Disabled;
        };

        match writer.save_run(run) {
            Ok(()) => PersistOutcome::Saved,
            Err(e) => {
                // Keep ingesting in memory; stop trying to save.
                warn!(
                    run_id = run.id(),
                    error = %e,
                    "saving run failed, auto-save disabled",
                );
                self.writer = None;
                PersistOutcome::Failed
            }
        }
    }
}

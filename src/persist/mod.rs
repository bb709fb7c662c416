//! Session persistence: CSV export of finalized runs and bulk import.

pub mod autosave;
pub mod session;

pub use autosave::{AutoSave, PersistOutcome};
pub use session::{import_run, import_session, PersistenceError, SessionWriter};

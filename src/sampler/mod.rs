mod session;
mod spool;

pub use session::{run_session, SessionProps, SessionStats, SymbolizerChoice};
pub use spool::{SpoolReader, SpoolWriter};

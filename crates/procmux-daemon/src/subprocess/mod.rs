//! Supervised OS processes.

mod error;
mod process;
mod supervisor;

pub use error::{ErrorKind, SupervisorError};
pub use process::{Process, ProcessHandle, ProcessInfo, ProcessOutput};
pub use supervisor::{OutputCallback, ProcessSupervisor, StatusCallback, SupervisorConfig};

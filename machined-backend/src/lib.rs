pub mod alloc;
pub mod args;
pub mod config;
pub mod device;
pub mod dirs;
pub mod error;
pub mod machine;
pub mod qmp;
pub mod registry;
pub mod vm;

pub use dirs::MachineDirs;
pub use error::{Error, Result};
pub use machine::{Machine, MachineRecord, MachineStatus};
pub use registry::MachineRegistry;

pub mod models;
pub mod ports;

pub use models::{DiskAttach, DiskDef, DiskFormat, DiskKind, NicDef, VmDef};
pub use ports::{Endpoint, PortRule, Protocol};

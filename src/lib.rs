pub mod daemonize;
pub mod logging;
pub mod options;
pub mod privdrop;
pub mod respawn;
pub mod runtime;
pub mod signals;
pub mod supervisor;

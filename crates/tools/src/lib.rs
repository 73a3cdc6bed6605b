//! Tool primitives: shell execution, filesystem operations confined to an
//! allowed root, and web fetch. Policy enforcement happens in the gateway's
//! permission broker — these functions only execute.

pub mod fs;
pub mod shell;
pub mod web;

pub use shell::{classify_shell_capability, ShellOutcome};

pub mod decode;
pub mod layout;
pub mod ledger;
pub mod loader;
pub mod normalize;
pub mod recovery;
pub mod scheduler;
pub mod source_file;

#[cfg(test)]
mod tests;

pub use recovery::RecoveryCoordinator;
pub use scheduler::{LoadScheduler, discover_files};
pub use source_file::SourceFileParser;

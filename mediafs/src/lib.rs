pub mod cache;
pub mod control;
pub mod errors;
pub mod fetch;
pub mod fixtures;
pub mod fs;
pub mod nodes;
pub mod scanner;
pub mod settings;
pub mod status;
pub mod tree;

mod instance;

pub use errors::Error;
pub use instance::Instance;
pub use scanner::ScanMode;
pub use settings::Settings;
pub use status::StatusSnapshot;

// Required for rstest_reuse templates in test modules.
#[cfg(test)]
use rstest_reuse;

pub mod analyze;
pub mod manifest;
pub mod modules;
pub mod version;

pub use analyze::Analyze;
pub use manifest::Manifest;
pub use modules::Modules;
pub use version::Version;

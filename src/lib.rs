pub mod build;
pub mod config;
pub mod lockfile;
pub mod matrix;
pub mod observability;
pub mod process;
pub mod project;
pub mod release;
pub mod scaffold;
pub mod scan;
pub mod template;
pub mod validation;

pub use config::Config;
pub use project::Project;
pub use template::BaseImage;

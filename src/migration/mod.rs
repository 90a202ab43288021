pub mod info;
pub mod sampler;
pub mod stepper;

pub use info::{MigrationInfo, MigrationUserInfo};
pub use stepper::{MigrateHandle, TableColumns};

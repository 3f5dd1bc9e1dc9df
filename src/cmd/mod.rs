pub mod run;
pub mod validate;

pub use run::{handle_run, RunArgs};
pub use validate::{handle_validate, ValidateArgs};

pub mod submit_run;

pub use submit_run::{SubmitRunCommand, SubmitRunError};

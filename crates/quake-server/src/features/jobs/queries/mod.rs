pub mod get_failure;
pub mod get_status;

pub use get_failure::{GetFailureError, GetFailureQuery};
pub use get_status::{GetStatusError, GetStatusQuery};

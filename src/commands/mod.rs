pub mod call_api;
pub mod util_api;

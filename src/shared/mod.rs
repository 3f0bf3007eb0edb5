pub mod ids;
pub mod run_id;

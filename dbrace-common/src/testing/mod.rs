//! Test support shared by unit and end-to-end tests.

pub mod log;

pub use log::init_global_test_logging;

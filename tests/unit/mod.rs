//! Unit tests for individual components

mod api_test;
mod config_test;
mod error_test;
mod store_test;
mod validator_test;

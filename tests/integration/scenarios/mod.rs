pub mod cli_tests;
pub mod compose_lifecycle_tests;
pub mod process_runner_tests;

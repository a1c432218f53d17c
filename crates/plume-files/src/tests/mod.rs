mod support;

mod download_tests;
mod generate_tests;
mod merge_tests;

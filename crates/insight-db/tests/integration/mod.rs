pub mod common;

mod insight_tests;
mod state_tests;
mod token_tests;

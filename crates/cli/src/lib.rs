//! The codeloom command-line front end.
//!
//! `main.rs` parses arguments and sets up logging; the pieces here build the
//! runtime and render it in a terminal.

pub mod app;
pub mod commands;
pub mod console;

pub use app::App;

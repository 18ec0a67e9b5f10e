//! Subcommand handlers

pub mod broker;
pub mod demo;
pub mod identity;

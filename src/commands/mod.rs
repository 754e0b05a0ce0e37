//! Command Handlers Module
//!
//! This module contains handlers for all CLI subcommands.

pub mod config;
pub mod mklabel;
pub mod run;
pub mod showlabel;

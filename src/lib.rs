#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod cli;
pub mod config;
pub mod control;
pub mod credentials;
pub mod error;
pub mod install;
pub mod logging;
pub mod network;
pub mod paths;
pub mod pipeline;
pub mod progress;
pub mod remote;
pub mod report;
pub mod runner;
pub mod util;

#[cfg(test)]
pub(crate) mod testing;

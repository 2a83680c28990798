//! lectern-lib: Core types and logic for Lectern
//!
//! This crate provides the building blocks of the course-material
//! build runner:
//! - `env`: layered environment dictionaries with `${...}` substitution
//! - `step`: raw project step records and their normalized form
//! - `builder`: phase orchestration for one build run
//! - `backend`: the container runtime contract and the Docker driver
//! - `observer`: phase and step state tracking fed to event sinks

pub mod backend;
pub mod builder;
pub mod cache;
pub mod cancel;
pub mod env;
pub mod observer;
pub mod step;

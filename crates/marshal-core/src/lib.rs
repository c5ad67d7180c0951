//! Core types shared across the marshal supervisor: branded identifiers,
//! the command tagged union, worker events, wire frames, and configuration.

pub mod command;
pub mod config;
pub mod event;
pub mod ids;
pub mod resources;
pub mod status;
pub mod usage;
pub mod wire;

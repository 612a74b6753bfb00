//! Contains the building blocks for creating tick-driven logic.
//!
//! This module provides the three primitives the `TickflowEngine` drives:
//! continuation paths (ordered steps), the named task table (keyed timers and
//! periodic jobs) and the timed queue (plain delayed or repeating callbacks).

pub mod path;
pub mod queue;
pub mod table;
pub mod task;

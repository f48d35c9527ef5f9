//! Extension hooks (spec.md §4.10): optional subsystems that interpose on
//! the event bus rather than living in the core dispatch path. `Manager`
//! wires these up once, against the same `Bus` the core uses.

pub mod bouncer_protocol;
pub mod control;
pub mod logger;

//! Controller tests against the real execution service and a simulated
//! sandbox.

mod lifecycle;
mod lifecycle_behaviour;
mod support;

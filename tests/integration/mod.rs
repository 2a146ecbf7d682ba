//! Integration test suite for callflow.
//!
//! These tests drive whole flows through the engine and the session against
//! the simulated transport, checking both the emitted values and the status
//! tree left behind.
//!
//! # Test Categories
//!
//! - `combinators`: Ordering, cancellation, retry and recovery semantics
//! - `scenarios`: Timed end-to-end runs under a paused clock
//! - `session`: Run lifecycle, supersession and reset
//!
//! All timing tests run with `start_paused = true`, so simulated delays cost
//! no wall-clock time.

mod fixtures;

mod combinators;

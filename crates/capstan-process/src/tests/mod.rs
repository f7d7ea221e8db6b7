//! Test suites for process supervision.

mod hooks;
mod support;

// Common test utilities
//
// Each integration test binary compiles this module; not every binary uses
// every helper.
#![allow(dead_code)]

pub mod fixtures;
pub mod harness;

#[allow(unused_imports)]
pub use fixtures::*;
#[allow(unused_imports)]
pub use harness::*;

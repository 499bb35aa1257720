//! Reusable fixtures for two-VASP scenarios.

mod two_vasp;

pub use two_vasp::{TwoVaspFixture, VaspSide};

//! # BDN Gateway Test Suite
//!
//! Unified test crate containing:
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── pipeline_scenarios.rs   # End-to-end block and transaction flows
//!     └── conversion_properties.rs# Cross-crate compression invariants
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p gateway-tests
//! cargo test -p gateway-tests integration::pipeline_scenarios::
//! ```

pub mod integration;

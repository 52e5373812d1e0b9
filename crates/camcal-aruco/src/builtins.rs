//! Embedded built-in dictionaries.
//!
//! The source of truth lives in `camcal-aruco/data/*_CODES.json`; `build.rs`
//! turns every file there into a constant.

#![allow(clippy::unreadable_literal, non_upper_case_globals)]

use crate::Dictionary;

include!(concat!(env!("OUT_DIR"), "/builtins.rs"));

// SPDX-License-Identifier: MIT

pub mod config;
pub mod error;
pub mod model;
pub mod recognition;

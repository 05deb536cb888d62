// SPDX-License-Identifier: MIT

//! Medical claim form extraction over OCR transcripts
//!
//! [`adk`] holds the capability seams (reasoning model, text recognition)
//! and the ambient config and error types. [`extraction`] holds the field
//! catalog and the workflow that turns a transcript into scored fields.

pub mod adk;
pub mod extraction;

//! Slot templates for Trellis paths.
//!
//! A template is plain text with `{name}` slots; `{{` and `}}` stand for
//! literal braces. Slots are filled from any [`SlotSource`].
//!
//! # Example
//! ```
//! use std::collections::HashMap;
//!
//! let mut vars = HashMap::new();
//! vars.insert("subject".to_string(), "R0001".to_string());
//! vars.insert("session".to_string(), "words".to_string());
//! let path = trellis_template::expand("{subject}_{session}-raw.fif", &vars).unwrap();
//! assert_eq!(path, "R0001_words-raw.fif");
//! ```

pub mod ast;
mod expand;
mod parser;

pub use ast::*;
pub use expand::{expand, Overlay, SlotSource};
pub use parser::slots_of;

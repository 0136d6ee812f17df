//! Core blueprint logic: types, values, references, parsing and expansion.

pub mod error;
pub mod expand;
pub mod fingerprint;
pub mod parser;
pub mod reference;
pub mod types;
pub mod value;

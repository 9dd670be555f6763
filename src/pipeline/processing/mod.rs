//! Record-level processing: transformations, rules and field mapping.

pub mod mapping;
pub mod rules;
pub mod transform;

//! HTTP routes for the validation server

pub mod definitions;
pub mod info;
pub mod validation;

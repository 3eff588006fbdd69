pub mod catalog;
pub mod global_variables;

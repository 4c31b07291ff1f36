pub mod constants;
pub mod instruction;
pub mod module;

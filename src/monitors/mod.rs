pub mod memory;
pub mod resources;
pub mod source;

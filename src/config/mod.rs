pub mod defs;
pub mod profiles;

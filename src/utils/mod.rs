pub mod command;
pub mod credentials;
pub mod file;
pub mod storage;
pub mod streams;
pub mod system;
pub mod transfer;

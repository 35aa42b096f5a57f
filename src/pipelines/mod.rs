pub mod gen_credentials;
pub mod orchestrator;
pub mod run;
pub mod stages;

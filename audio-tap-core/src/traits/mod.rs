pub mod capture_backend;
pub mod capture_delegate;
pub mod consent_checker;
pub mod topology_source;

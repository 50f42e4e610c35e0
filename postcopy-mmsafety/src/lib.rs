pub mod config;
pub mod error;
pub mod instance;
pub mod orchestrator;
pub mod phase;
pub mod qmp;
pub mod relay;
pub mod serial;
pub mod uffd;
pub mod uri;

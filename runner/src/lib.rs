pub mod codec;
pub mod collaborators;
pub mod config;
pub mod job;
pub mod partition;
pub mod request;
pub mod script;
pub mod service;
pub mod tracker;

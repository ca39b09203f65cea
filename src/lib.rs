pub mod bus;
pub mod capability;
pub mod chat;
pub mod cli;
pub mod config;
pub mod control;
pub mod doctor;
pub mod error;
pub mod history;
pub mod model;
pub mod plan;
pub mod profiles;
pub mod prompts;
pub mod provider;
pub mod runner;
pub mod runtime;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod tools;

#[cfg(test)]
mod tests;

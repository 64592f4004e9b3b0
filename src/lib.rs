//! sandbox-session-mcp daemon library
//!
//! This crate provides the core functionality for the sandbox-session-mcp
//! daemon:
//! - Configuration parsing from process environment variables
//! - A session and resource coordinator fronting a remote sandbox-execution
//!   provider (the Facade, Session Manager, Resource Manager and Managed
//!   Session types)
//! - An MCP server implementation using `rmcp` exposing that coordinator as
//!   five tools

pub mod config;
pub mod error;
pub mod facade;
pub mod mcp;
pub mod provider;
pub mod resource;
pub mod session;

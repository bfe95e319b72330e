//! odoo-inspect-mcp daemon library
//!
//! This crate provides the execution and response-shaping core for
//! inspecting a containerized Odoo runtime:
//! - Running code in the runtime container with timeouts and start-on-demand
//! - Choosing between the live registry and static analysis of addon sources
//! - Paginating and size-limiting every response
//! - An MCP server exposing the above as tools

pub mod backend;
pub mod config;
pub mod exec;
pub mod mcp;
pub mod mode;
pub mod pagination;
pub mod registry;
pub mod response;
pub mod session;
pub mod size_guard;
pub mod static_index;

//! Research tools: JSON envelopes shared by the CLI and the MCP stdio server.

pub(crate) mod envelope;
#[cfg(feature = "stdio")]
pub(crate) mod server;
pub(crate) mod tools;

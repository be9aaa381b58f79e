//! Wire format spoken with child processes.
//!
//! - `codec`: newline framing with a bounded line length.
//! - `envelope`: JSON-RPC request/response envelopes relayed verbatim.

pub mod codec;
pub mod envelope;

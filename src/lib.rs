//! Multi-client chat relay over plain TCP.
//!
//! Clients connect, send their display name as the first line, and then
//! exchange broadcast messages, private messages, and file downloads
//! through the relay. Each module focuses on a concrete responsibility:
//!
//! - [`cli`] parses the command-line interface for serve and client modes.
//! - [`relay`] accepts TCP connections, runs one worker task per session,
//!   and routes commands between sessions through the shared [`registry`].
//! - [`registry`] is the table of live sessions and the only shared state.
//! - [`protocol`] decodes client command lines and formats server notices.
//! - [`transfer`] streams file bodies over the same connection as chat,
//!   framed by a byte count so content is never misread as control data.
//! - [`client`] connects to a relay, multiplexing stdin and server
//!   messages for a terminal user, and writes received files to disk.
//!
//! Integration tests use this crate directly to exercise the relay state
//! machine and wire protocol.

pub mod cli;
pub mod client;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod transfer;

//! Reverse tunnel: a relay server exposes ports on behalf of clients that
//! dial in from behind NAT, and clients splice each public connection to a
//! local service.
//!
//! Every connection to the server speaks the same frame codec
//! (`[code:1][len:1][payload:len]`). A control connection authenticates,
//! binds one public port and then receives a `NOTIFY` per public connection.
//! The client answers each with a fresh data connection carrying
//! `NEW_DATA_CONN`, which the server pairs with the waiting public
//! connection and relays.

pub mod acl;
pub mod auth;
pub mod bind;
pub mod client;
pub mod control;
pub mod protocol;
pub mod relay;
pub mod server;

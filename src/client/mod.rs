//! Client-side library: the connection stub gateways and tests use to
//! talk to a serving node.

mod apistub;

pub use apistub::BoardClient;

//! Record sinks. `http` replays requests against a live service, the
//! others persist or forward records unchanged.

pub(crate) mod client;
pub(crate) mod dummy;
pub(crate) mod file;
pub(crate) mod http;
pub(crate) mod tcp;

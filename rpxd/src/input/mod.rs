//! Record sources: live capture, capture files, the TCP transport, a plain
//! HTTP endpoint and a synthetic generator.

pub(crate) mod dummy;
pub(crate) mod file;
pub(crate) mod http;
pub(crate) mod raw;
pub(crate) mod tcp;

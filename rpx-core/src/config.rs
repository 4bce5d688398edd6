mod defaults;
mod load;
mod types;
mod validate;

pub use load::{load_config, load_configs};
pub use types::*;
pub use validate::{capture_port, parse_header_rule, parse_limit, LimitSpec};

#[cfg(test)]
mod tests;

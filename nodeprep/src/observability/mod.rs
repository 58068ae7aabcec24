//! Logging setup and stage timing.

mod logging;
mod timer;

pub use logging::{default_directives, init_tracing};
pub use timer::SpanTimer;

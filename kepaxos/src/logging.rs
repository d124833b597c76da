//! Structured logging, matching the teacher crate's `logging` feature: a
//! `slog` root logger that is a no-op `Discard` sink when the feature is
//! off, so call sites never need a `#[cfg(feature = "logging")]`.

#[cfg(feature = "logging")]
use slog::Drain;

/// Build the default root logger for a replica.
///
/// With the `logging` feature enabled this logs asynchronously to stderr in
/// a compact terminal format; without it, logging is compiled out to a
/// `Discard` drain so the rest of the crate pays no runtime cost.
#[cfg(feature = "logging")]
pub fn default_logger(my_index: u8) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!("replica" => my_index))
}

#[cfg(not(feature = "logging"))]
pub fn default_logger(_my_index: u8) -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

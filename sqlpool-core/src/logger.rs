use std::time::{Duration, Instant};

// Emits a `tracing` event at a level only known at runtime.
#[doc(hidden)]
#[macro_export]
macro_rules! private_tracing_dynamic_event {
    (target: $target:expr, $level:expr, $($args:tt)*) => {{
        use ::tracing::Level;

        match $level {
            Level::ERROR => ::tracing::event!(target: $target, Level::ERROR, $($args)*),
            Level::WARN => ::tracing::event!(target: $target, Level::WARN, $($args)*),
            Level::INFO => ::tracing::event!(target: $target, Level::INFO, $($args)*),
            Level::DEBUG => ::tracing::event!(target: $target, Level::DEBUG, $($args)*),
            Level::TRACE => ::tracing::event!(target: $target, Level::TRACE, $($args)*),
        }
    }};
}

pub(crate) fn level_filter_to_trace_level(filter: log::LevelFilter) -> Option<tracing::Level> {
    match filter {
        log::LevelFilter::Error => Some(tracing::Level::ERROR),
        log::LevelFilter::Warn => Some(tracing::Level::WARN),
        log::LevelFilter::Info => Some(tracing::Level::INFO),
        log::LevelFilter::Debug => Some(tracing::Level::DEBUG),
        log::LevelFilter::Trace => Some(tracing::Level::TRACE),
        log::LevelFilter::Off => None,
    }
}

/// Logs the summary and execution time of a statement once it finishes.
pub(crate) struct StatementLogger<'q> {
    sql: Option<&'q str>,
    start: Instant,
    slow_threshold: Duration,
}

impl<'q> StatementLogger<'q> {
    pub fn new(sql: Option<&'q str>, slow_threshold: Duration) -> Self {
        Self {
            sql,
            start: Instant::now(),
            slow_threshold,
        }
    }

    pub fn finish(self, connection_id: impl std::fmt::Display) {
        let elapsed = self.start.elapsed();
        let summary = self.sql.map(parse_query_summary).unwrap_or_default();

        if elapsed >= self.slow_threshold {
            tracing::warn!(
                target: "sqlpool::query",
                %connection_id,
                %summary,
                elapsed_secs = elapsed.as_secs_f64(),
                "slow statement"
            );
        } else {
            tracing::trace!(
                target: "sqlpool::query",
                %connection_id,
                %summary,
                elapsed_secs = elapsed.as_secs_f64(),
                "statement finished"
            );
        }
    }
}

pub(crate) fn parse_query_summary(query: &str) -> String {
    // For now, just take the first 3 words
    query
        .split_whitespace()
        .take(3)
        .collect::<Vec<&str>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_takes_the_first_words() {
        assert_eq!(
            parse_query_summary("SELECT id,\n  name FROM accounts WHERE id = ?"),
            "SELECT id, name"
        );
    }

    #[test]
    fn off_disables_the_event() {
        assert_eq!(level_filter_to_trace_level(log::LevelFilter::Off), None);
        assert_eq!(
            level_filter_to_trace_level(log::LevelFilter::Warn),
            Some(tracing::Level::WARN)
        );
    }
}

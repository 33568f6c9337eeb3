use time::UtcOffset;
use tracing_subscriber::{
    fmt::time::OffsetTime, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
    Registry,
};

use crate::config::LoggingConfig;
use crate::errors::{ConfigError, UmdtError};

pub fn setup_logging(config: &LoggingConfig) -> Result<(), UmdtError> {
    config.validate()?;

    let timer = OffsetTime::new(
        UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC),
        time::format_description::well_known::Rfc3339,
    );

    let base_level = config.get_level_filter();
    let mut env_filter = EnvFilter::default().add_directive(base_level.into());

    // Frame dumps live at trace level in the codec and transports.
    if config.trace_frames {
        env_filter = env_filter
            .add_directive("umdt::codec=trace".parse().expect("static directive"))
            .add_directive("umdt::transport=trace".parse().expect("static directive"));
    }

    let registry = Registry::default();
    let result = if config.format.to_lowercase() == "json" {
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_thread_ids(config.thread_ids)
            .with_thread_names(config.thread_names)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_timer(timer)
            .with_filter(env_filter);
        registry.with(layer).try_init()
    } else {
        let layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(config.thread_ids)
            .with_thread_names(config.thread_names)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_level(true)
            .with_timer(timer)
            .with_filter(env_filter);
        registry.with(layer).try_init()
    };

    result.map_err(|e| {
        UmdtError::Config(ConfigError::invalid(format!(
            "Failed to initialize logging: {}",
            e
        )))
    })
}

use tracing::level_filters::LevelFilter;

pub mod config;
pub mod error;
pub mod event;
pub mod media;
pub mod model;
pub mod session;
#[cfg(test)]
pub(crate) mod testing;
pub mod transport;

pub type CallId = String;
pub type UserId = String;
pub type TrackId = String;

// get timestamp in milliseconds
pub fn get_timestamp() -> u64 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as u64
}

/// Install the tracing subscriber described by the config. Safe to call more
/// than once; later calls are no-ops.
pub fn init_logging(config: &config::Config) {
    let mut log_fmt = tracing_subscriber::fmt();
    if let Some(ref level) = config.log_level {
        if let Ok(lv) = level.as_str().parse::<LevelFilter>() {
            log_fmt = log_fmt.with_max_level(lv);
        }
    }

    if let Some(ref log_file) = config.log_file {
        match std::fs::File::create(log_file) {
            Ok(file) => {
                let (non_blocking, guard) = tracing_appender::non_blocking(file);
                Box::leak(Box::new(guard));
                log_fmt.with_writer(non_blocking).try_init().ok();
            }
            Err(e) => {
                log_fmt.try_init().ok();
                tracing::warn!("failed to create log file {}: {}", log_file, e);
            }
        }
    } else {
        log_fmt.try_init().ok();
    }
}

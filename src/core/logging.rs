//! Logging initialization and utilities

/// Initialize the logging system
///
/// Uses env_logger with a default filter level of `info`. Override with the
/// RUST_LOG environment variable. When RUST_LOG is unset but the legacy
/// `DEBUG` channel variable is present, its channel spec is translated into
/// an env_logger filter (see [`debug_spec_to_filter`]).
///
/// # Example
/// ```
/// voxtree::core::logging::init();
/// log::info!("store opened");
/// ```
pub fn init() {
    let default = match std::env::var("DEBUG") {
        Ok(spec) => debug_spec_to_filter(&spec).unwrap_or_else(|| "info".into()),
        Err(_) => "info".into(),
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .try_init()
        .ok();
}

/// Translate the legacy `DEBUG=<channel>=+|-<class>(,...)(;...)` spec into an
/// env_logger filter string.
///
/// Classes map to log levels: `err` -> error, `warn` -> warn,
/// `fixme` -> debug, `trace` -> trace. For each channel the most verbose
/// enabled class wins; a channel with everything disabled maps to `off`.
pub fn debug_spec_to_filter(spec: &str) -> Option<String> {
    let mut directives = Vec::new();
    for channel_spec in spec.split(';') {
        let channel_spec = channel_spec.trim();
        if channel_spec.is_empty() {
            continue;
        }
        let (channel, classes) = channel_spec.split_once('=')?;
        let channel = channel.trim();
        if channel.is_empty() {
            return None;
        }

        // verbosity rank: off=0, error=1, warn=2, debug=3, trace=4
        let mut rank = 0u8;
        for class in classes.split(',') {
            let class = class.trim();
            let (enable, name) = match class.split_at_checked(1)? {
                ("+", rest) => (true, rest),
                ("-", rest) => (false, rest),
                _ => return None,
            };
            if !enable {
                continue;
            }
            let class_rank = match name {
                "err" => 1,
                "warn" => 2,
                "fixme" => 3,
                "trace" => 4,
                _ => return None,
            };
            rank = rank.max(class_rank);
        }
        let level = ["off", "error", "warn", "debug", "trace"][rank as usize];
        directives.push(format!("{channel}={level}"));
    }
    if directives.is_empty() {
        None
    } else {
        Some(directives.join(","))
    }
}

// Leveled logging infrastructure
//
// This will be used from multiple threads, so it needs
// to be stateless. The verbosity is chosen once from the
// VULKAN_WSI_DEBUG_LEVEL environment variable:
//   0 - off
//   1 - errors
//   2 - + warnings
//   3 - + info
#[allow(dead_code, non_camel_case_types)]
#[derive(Copy, Clone)]
pub enum LogLevel {
    // in order of highest priority
    error,
    warning,
    info,
    debug, // internal tracing, never enabled by the documented levels
}

impl LogLevel {
    pub fn get_name(&self) -> &'static str {
        match self {
            LogLevel::error => "error",
            LogLevel::warning => "warning",
            LogLevel::info => "info",
            LogLevel::debug => "debug",
        }
    }

    pub fn get_level(&self) -> u32 {
        match self {
            LogLevel::error => 1,
            LogLevel::warning => 2,
            LogLevel::info => 3,
            LogLevel::debug => 4,
        }
    }
}

/// The level selected through the environment.
pub fn env_level() -> u32 {
    lazy_static::lazy_static! {
        static ref LOG_LEVEL_RAW: u32 = match std::env::var("VULKAN_WSI_DEBUG_LEVEL") {
            Ok(val) => val.trim().parse::<u32>().unwrap_or(1),
            Err(_) => 1,
        };
    }
    *LOG_LEVEL_RAW
}

#[doc(hidden)]
pub fn log_internal(level: LogLevel, file: &str, line: u32, args: std::fmt::Arguments) {
    if level.get_level() <= env_level() {
        eprintln!(
            "[{}]<{}> {}:{} - {}",
            crate::timing::get_current_millis(),
            level.get_name(),
            file,
            line,
            args
        );
    }
}

#[macro_export]
macro_rules! error {
    ($($format_args:tt)+) => {{
        $crate::logging::log_internal(
            $crate::logging::LogLevel::error,
            file!(),
            line!(),
            format_args!($($format_args)+),
        )
    }};
}

#[macro_export]
macro_rules! warning {
    ($($format_args:tt)+) => {{
        $crate::logging::log_internal(
            $crate::logging::LogLevel::warning,
            file!(),
            line!(),
            format_args!($($format_args)+),
        )
    }};
}

#[macro_export]
macro_rules! info {
    ($($format_args:tt)+) => {{
        $crate::logging::log_internal(
            $crate::logging::LogLevel::info,
            file!(),
            line!(),
            format_args!($($format_args)+),
        )
    }};
}

#[macro_export]
macro_rules! debug {
    ($($format_args:tt)+) => {{
        $crate::logging::log_internal(
            $crate::logging::LogLevel::debug,
            file!(),
            line!(),
            format_args!($($format_args)+),
        )
    }};
}

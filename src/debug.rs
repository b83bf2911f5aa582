//! Logging setup for proxyboot.
//!
//! The library logs through the `log` facade under per-concern targets.
//! Set the `PROXYBOOT_DEBUG` environment variable to turn on debug output for
//! some of them:
//! - `PROXYBOOT_DEBUG=1` - Enable all debug output
//! - `PROXYBOOT_DEBUG=proxy` - Only proxy request/reply traffic
//! - `PROXYBOOT_DEBUG=transfer,fdt` - Enable multiple categories
//!
//! `RUST_LOG` still wins when it is set.

use log::LevelFilter;

/// Debug categories that can be enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCategory {
    Proxy,
    Transfer,
    Fdt,
    Boot,
    Timer,
}

impl DebugCategory {
    const ALL: [DebugCategory; 5] = [
        DebugCategory::Proxy,
        DebugCategory::Transfer,
        DebugCategory::Fdt,
        DebugCategory::Boot,
        DebugCategory::Timer,
    ];

    /// The `log` target used by this category.
    pub fn target(self) -> &'static str {
        match self {
            DebugCategory::Proxy => "proxyboot::proxy",
            DebugCategory::Transfer => "proxyboot::transfer",
            DebugCategory::Fdt => "proxyboot::fdt",
            DebugCategory::Boot => "proxyboot::boot",
            DebugCategory::Timer => "proxyboot::timer",
        }
    }

    fn name(self) -> &'static str {
        match self {
            DebugCategory::Proxy => "proxy",
            DebugCategory::Transfer => "transfer",
            DebugCategory::Fdt => "fdt",
            DebugCategory::Boot => "boot",
            DebugCategory::Timer => "timer",
        }
    }
}

/// Parse a `PROXYBOOT_DEBUG` value into the categories it enables.
pub fn parse_categories(value: &str) -> Vec<DebugCategory> {
    let lower = value.trim().to_lowercase();
    if lower == "1" || lower == "all" {
        return DebugCategory::ALL.to_vec();
    }
    DebugCategory::ALL
        .into_iter()
        .filter(|cat| lower.split(',').any(|part| part.trim() == cat.name()))
        .collect()
}

/// Initialise the global logger.
///
/// `verbose` raises the default level from `info` to `debug` for every
/// category. Calling this more than once is harmless.
pub fn init(verbose: bool) {
    let default_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(LevelFilter::Warn);
    builder.filter_module("proxyboot", default_level);

    if let Ok(value) = std::env::var("PROXYBOOT_DEBUG") {
        for category in parse_categories(&value) {
            builder.filter_module(category.target(), LevelFilter::Debug);
        }
    }

    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }

    builder.format_timestamp_millis();
    let _ = builder.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all() {
        assert_eq!(parse_categories("1").len(), 5);
        assert_eq!(parse_categories("ALL").len(), 5);
    }

    #[test]
    fn test_parse_list() {
        let cats = parse_categories("proxy, fdt");
        assert_eq!(cats, vec![DebugCategory::Proxy, DebugCategory::Fdt]);
        assert!(parse_categories("bogus").is_empty());
    }
}

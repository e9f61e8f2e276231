use tracing::level_filters::LevelFilter;

const SCALER_INSTANCE: &str = "SCALER_INSTANCE";

const DEFAULT_INSTANCE: &str = "default";

pub fn get_instance_name() -> String {
    std::env::var(SCALER_INSTANCE).unwrap_or_else(|_| DEFAULT_INSTANCE.to_string())
}

const SCALER_CONFIG: &str = "SCALER_CONFIG";

pub fn get_config_path() -> Option<String> {
    std::env::var(SCALER_CONFIG).ok()
}

const SCALER_LOG: &str = "SCALER_LOG";

const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::INFO;

pub fn get_log_level() -> LevelFilter {
    let level_from_env = std::env::var(SCALER_LOG);
    level_from_env.map_or(DEFAULT_LOG_LEVEL, |res| {
        res.parse().unwrap_or(DEFAULT_LOG_LEVEL)
    })
}

/// Human readable byte count (`1.5 GiB`)
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(10 * 1024 * 1024 * 1024), "10.0 GiB");
    }
}

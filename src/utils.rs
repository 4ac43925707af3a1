pub mod tracker;

pub use tracker::{ByteCounter, CountingWriter, percent_of, spawn_progress_sampler};

const MB: f64 = 1f64 / 1024f64 / 1024f64;

pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 * MB
}

/// Human readable size using binary units, e.g. "14.8 GiB"
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KiB");
        assert_eq!(format_size(1887436800), "1.8 GiB");
        assert_eq!(format_size(32 * 1024 * 1024 * 1024), "32.0 GiB");
    }

    #[test]
    fn test_bytes_to_mb() {
        assert_eq!(bytes_to_mb(3 * 1024 * 1024), 3.0);
    }
}

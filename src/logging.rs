use std::io::Write;
use std::sync::Once;

use chrono::Local;
use log::LevelFilter;

static INIT: Once = Once::new();

/// Installs the process logger at `level`.
///
/// `RUST_LOG`, when set, overrides the level. Calling this again is a no-op.
pub fn init(level: LevelFilter) {
    INIT.call_once(|| {
        let result = env_logger::Builder::new()
            .filter_level(level)
            .parse_default_env()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] {}: {}",
                    Local::now().to_rfc3339(),
                    record.level(),
                    record.target(),
                    record.args()
                )
            })
            .try_init();

        match result {
            Ok(()) => log::info!("Logging initialized at {}", level),
            Err(e) => eprintln!("Failed to initialize logger: {}", e),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice() {
        init(LevelFilter::Debug);
        init(LevelFilter::Trace);
        assert!(log::max_level() >= LevelFilter::Error);
    }
}

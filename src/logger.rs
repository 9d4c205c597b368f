use log::{Log, Metadata, Record};
use std::{sync::OnceLock, time::Instant};

static LOGGER: Logger = Logger {
    started: OnceLock::new(),
};

pub fn setup_logger(max_level: log::LevelFilter) -> Result<(), log::SetLoggerError> {
    LOGGER.started.get_or_init(Instant::now);
    log::set_logger(&LOGGER)?;
    log::set_max_level(max_level);
    Ok(())
}

struct Logger {
    started: OnceLock<Instant>,
}

impl Logger {
    fn uptime(&self) -> f64 {
        self.started
            .get()
            .map(|started| started.elapsed().as_secs_f64())
            .unwrap_or_default()
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // Workers log concurrently, the uptime prefix keeps interleaved lines ordered.
        println!(
            "[{:>10.3}] {} {} -- {}",
            self.uptime(),
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

pub fn fmt_slice_hex(data: &[u8]) -> impl std::fmt::Display + '_ {
    struct HexSlice<'a>(&'a [u8]);
    impl std::fmt::Display for HexSlice<'_> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            for (i, b) in self.0.iter().enumerate() {
                write!(f, "{b:02x}")?;
                if i + 1 < self.0.len() {
                    write!(f, " ")?;
                }
            }
            Ok(())
        }
    }
    HexSlice(data)
}

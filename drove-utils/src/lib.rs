use color_eyre::eyre::{bail, Result};
use tracing::Level;
use tracing_subscriber::{filter::LevelFilter, FmtSubscriber};

/// Environment variable naming the rendezvous directory host.
pub const REGISTRY_IP_VAR: &str = "REGISTRY_IP";

/// Environment variable toggling driver-level thread-unsafe fast paths.
pub const SINGLE_THREADED_VAR: &str = "DROVE_SINGLE_THREADED";

/// Rendezvous directory host, when one is configured.
pub fn registry_ip() -> Option<String> {
    std::env::var(REGISTRY_IP_VAR).ok()
}

pub fn single_threaded() -> bool {
    match std::env::var(SINGLE_THREADED_VAR) {
        Ok(val) => val == "1",
        Err(_) => false,
    }
}

/// Role a process runs in, derived from the `--master`/`--is-client` flags.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum AppMode {
    Client,
    Server,
}

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum TraceLevel {
    Debug,
    Info,
    Warn,
    Error,
    Off,
}

impl std::str::FromStr for TraceLevel {
    type Err = color_eyre::eyre::Error;
    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "debug" => TraceLevel::Debug,
            "info" => TraceLevel::Info,
            "warn" => TraceLevel::Warn,
            "error" => TraceLevel::Error,
            "off" => TraceLevel::Off,
            x => bail!("unknown TRACE level {:?}", x),
        })
    }
}

pub fn global_debug_init(trace_level: TraceLevel) -> Result<()> {
    color_eyre::install()?;
    let subscriber = match trace_level {
        TraceLevel::Debug => FmtSubscriber::builder()
            .with_max_level(Level::DEBUG)
            .finish(),
        TraceLevel::Info => FmtSubscriber::builder()
            .with_max_level(Level::INFO)
            .finish(),
        TraceLevel::Warn => FmtSubscriber::builder()
            .with_max_level(Level::WARN)
            .finish(),
        TraceLevel::Error => FmtSubscriber::builder()
            .with_max_level(Level::ERROR)
            .finish(),
        TraceLevel::Off => FmtSubscriber::builder()
            .with_max_level(LevelFilter::OFF)
            .finish(),
    };
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn trace_level_parses() {
        assert_eq!(TraceLevel::from_str("info").unwrap(), TraceLevel::Info);
        assert_eq!(TraceLevel::from_str("off").unwrap(), TraceLevel::Off);
        assert!(TraceLevel::from_str("loud").is_err());
    }
}

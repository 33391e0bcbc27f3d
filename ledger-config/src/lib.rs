#![forbid(unsafe_code)]
//! Application configuration of the ledger sync engine: rpc endpoints, data directory,
//! logging and engine tuning.

use std::{
    io::{self, Error, ErrorKind},
    path::{Path, PathBuf},
};

use log::LevelFilter;
use log4rs::{
    append::rolling_file::{
        policy::compound::{
            roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger, CompoundPolicy,
        },
        RollingFileAppender,
    },
    config::{Appender, Root},
    encode::pattern::PatternEncoder,
    filter::threshold::ThresholdFilter,
    Config,
};
use serde::{Deserialize, Serialize};

use ledger_sync::config::SyncConfig;

pub const DEFAULT_PRIMARY_RPC: &str = "https://api.mainnet-beta.ledger.example:8899";
pub const DEFAULT_RPC_PORT: u16 = 8899;
pub const DEFAULT_LOGFILE_NAME: &str = "ledger-sync.debug.log";
pub const DEFAULT_CONFIG_NAME: &str = "ledger-sync.json";

/// Errors of loading or interpreting a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An rpc address is not a valid uri.
    #[error("invalid rpc uri {uri}. {source}")]
    InvalidUri {
        /// the rejected address
        uri: String,
        /// parse failure
        source: http::uri::InvalidUri,
    },
    /// The configuration file could not be read.
    #[error("failed to read config file. {0}")]
    Io(#[from] io::Error),
    /// The configuration file is not valid json.
    #[error("failed to parse config file. {0}")]
    Parse(#[from] serde_json::Error),
}

fn parse_uri(uri: String) -> Result<http::Uri, ConfigError> {
    uri.parse()
        .map_err(|source| ConfigError::InvalidUri { uri, source })
}

/// Normalises an rpc address: a missing scheme defaults to http and a missing port to
/// [`DEFAULT_RPC_PORT`]. `None` yields [`DEFAULT_PRIMARY_RPC`].
pub fn construct_rpc_uri(server: Option<String>) -> Result<http::Uri, ConfigError> {
    let server = match server {
        Some(s) => {
            let mut s = if s.starts_with("http") {
                s
            } else {
                "http://".to_string() + &s
            };
            let uri = parse_uri(s.clone())?;
            if uri.port().is_none() {
                s = format!("{}:{}", s.trim_end_matches('/'), DEFAULT_RPC_PORT);
            }
            s
        }
        None => DEFAULT_PRIMARY_RPC.to_string(),
    };
    parse_uri(server)
}

/// The ledger network the engine syncs from. Each network keeps its data in its own
/// directory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
    /// a local test ledger
    Localnet,
}

impl Network {
    fn data_subdir(&self) -> Option<&'static str> {
        match self {
            Network::Mainnet => None,
            Network::Testnet => Some("testnet"),
            Network::Localnet => Some("localnet"),
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Localnet => "localnet",
        };
        write!(f, "{name}")
    }
}

/// On-disk form of [`LedgerSyncConfig`]. Every field is optional.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub primary_rpc: Option<String>,
    pub fallback_rpc: Option<String>,
    pub network: Network,
    pub data_dir: Option<PathBuf>,
    pub logfile_name: Option<PathBuf>,
    pub sync: SyncConfig,
}

/// Configuration data necessary for launching a sync engine.
///
/// A host process calls [`LedgerSyncConfig::init_logging`] once, builds its remote ledger
/// clients for `primary_uri` and `fallback_uri`, then passes
/// [`LedgerSyncConfig::sync_config`] to `ledger_sync::sync::SyncEngine::launch`.
#[derive(Clone, Debug)]
pub struct LedgerSyncConfig {
    pub primary_uri: http::Uri,
    /// Archive node used by the backward job once the primary runs out of history.
    pub fallback_uri: Option<http::Uri>,
    pub network: Network,
    /// The directory where the store and logfiles will be created. By default, this will be
    /// in ~/.ledger-sync on Linux and the app data directory on macOS and Windows.
    pub data_dir: Option<PathBuf>,
    /// The filename of the logfile. This will be created in the data directory.
    pub logfile_name: PathBuf,
    pub sync: SyncConfig,
}

impl LedgerSyncConfig {
    // Create an unconnected (to any server) config to test local storage etc...
    pub fn create_unconnected(network: Network, dir: Option<PathBuf>) -> LedgerSyncConfig {
        LedgerSyncConfig {
            primary_uri: http::Uri::default(),
            fallback_uri: None,
            network,
            data_dir: dir,
            logfile_name: DEFAULT_LOGFILE_NAME.into(),
            sync: SyncConfig::default(),
        }
    }

    /// Builds a config from its on-disk form.
    pub fn from_file(file: ConfigFile) -> Result<LedgerSyncConfig, ConfigError> {
        Ok(LedgerSyncConfig {
            primary_uri: construct_rpc_uri(file.primary_rpc)?,
            fallback_uri: file
                .fallback_rpc
                .map(|uri| construct_rpc_uri(Some(uri)))
                .transpose()?,
            network: file.network,
            data_dir: file.data_dir,
            logfile_name: file
                .logfile_name
                .unwrap_or_else(|| DEFAULT_LOGFILE_NAME.into()),
            sync: file.sync,
        })
    }

    /// Reads a json config file.
    pub fn load(path: &Path) -> Result<LedgerSyncConfig, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let file: ConfigFile = serde_json::from_str(&contents)?;
        Self::from_file(file)
    }

    pub fn set_data_dir(&mut self, dir_str: String) {
        self.data_dir = Some(PathBuf::from(dir_str));
    }

    /// The engine tuning parameters.
    pub fn sync_config(&self) -> &SyncConfig {
        &self.sync
    }

    /// Build the Logging config
    pub fn get_log_config(&self) -> io::Result<Config> {
        let window_size = 3; // log0, log1, log2
        let log_path = self.get_log_path()?;
        let roller_pattern = log_path.with_extension("{}");
        let fixed_window_roller = FixedWindowRoller::builder()
            .build(&roller_pattern.to_string_lossy(), window_size)
            .map_err(|e| Error::new(ErrorKind::Other, format!("{}", e)))?;
        let size_limit = 5 * 1024 * 1024; // 5MB as max log file size to roll
        let size_trigger = SizeTrigger::new(size_limit);
        let compound_policy =
            CompoundPolicy::new(Box::new(size_trigger), Box::new(fixed_window_roller));

        Config::builder()
            .appender(
                Appender::builder()
                    .filter(Box::new(ThresholdFilter::new(LevelFilter::Info)))
                    .build(
                        "logfile",
                        Box::new(
                            RollingFileAppender::builder()
                                .encoder(Box::new(PatternEncoder::new("{d} {l}::{m}{n}")))
                                .build(log_path, Box::new(compound_policy))?,
                        ),
                    ),
            )
            .build(
                Root::builder()
                    .appender("logfile")
                    .build(LevelFilter::Debug),
            )
            .map_err(|e| Error::new(ErrorKind::Other, format!("{}", e)))
    }

    /// Installs the logging config as the global logger.
    pub fn init_logging(&self) -> io::Result<log4rs::Handle> {
        log4rs::init_config(self.get_log_config()?)
            .map_err(|e| Error::new(ErrorKind::Other, format!("{}", e)))
    }

    /// The data directory, created if missing.
    pub fn get_data_dir(&self) -> io::Result<Box<Path>> {
        let data_location = match &self.data_dir {
            // If there's some --data-dir path provided, use it
            Some(dir) => dir.clone(),
            None => {
                #[cfg(any(target_os = "macos", target_os = "windows"))]
                let mut location = {
                    let mut location = dirs::data_dir().ok_or_else(|| {
                        Error::new(ErrorKind::NotFound, "Couldn't determine app data directory")
                    })?;
                    location.push("LedgerSync");
                    location
                };

                #[cfg(not(any(target_os = "macos", target_os = "windows")))]
                let mut location = {
                    let mut location = dirs::home_dir().ok_or_else(|| {
                        Error::new(ErrorKind::NotFound, "Couldn't determine home directory")
                    })?;
                    location.push(".ledger-sync");
                    location
                };

                if let Some(subdir) = self.network.data_subdir() {
                    location.push(subdir);
                }
                location
            }
        };

        std::fs::create_dir_all(&data_location).map_err(|e| {
            log::error!("Couldn't create data directory {:?}. {}", data_location, e);
            e
        })?;
        Ok(data_location.into_boxed_path())
    }

    pub fn get_log_path(&self) -> io::Result<Box<Path>> {
        let mut log_path = self.get_data_dir()?.into_path_buf();
        log_path.push(&self.logfile_name);

        Ok(log_path.into_boxed_path())
    }

    /// Path of the default config file inside the data directory.
    pub fn get_config_path(&self) -> io::Result<Box<Path>> {
        let mut config_path = self.get_data_dir()?.into_path_buf();
        config_path.push(DEFAULT_CONFIG_NAME);

        Ok(config_path.into_boxed_path())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use test_case::test_case;

    use super::*;

    #[test_case(None, "https://api.mainnet-beta.ledger.example:8899/" ; "default endpoint")]
    #[test_case(Some("localhost"), "http://localhost:8899/" ; "scheme and port added")]
    #[test_case(Some("https://node.example:443"), "https://node.example:443/" ; "complete uri kept")]
    #[test_case(Some("node.example:9000"), "http://node.example:9000/" ; "port kept")]
    fn rpc_uris_are_normalised(server: Option<&str>, expected: &str) {
        let uri = construct_rpc_uri(server.map(str::to_string)).unwrap();
        assert_eq!(uri.to_string(), expected);
    }

    #[test]
    fn invalid_rpc_uris_are_rejected() {
        assert!(matches!(
            construct_rpc_uri(Some("not a uri".to_string())),
            Err(ConfigError::InvalidUri { .. })
        ));
    }

    #[test]
    fn config_files_fill_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_NAME);
        std::fs::write(
            &path,
            r#"{
                "primary_rpc": "localhost",
                "fallback_rpc": "archive.example:9000",
                "network": "localnet",
                "sync": { "coverage": { "chunk_timeframe": { "secs": 3600, "nanos": 0 } } }
            }"#,
        )
        .unwrap();

        let config = LedgerSyncConfig::load(&path).unwrap();
        assert_eq!(config.primary_uri.to_string(), "http://localhost:8899/");
        assert_eq!(
            config.fallback_uri.as_ref().map(|uri| uri.to_string()),
            Some("http://archive.example:9000/".to_string())
        );
        assert_eq!(config.network, Network::Localnet);
        assert_eq!(config.logfile_name, PathBuf::from(DEFAULT_LOGFILE_NAME));
        assert_eq!(
            config.sync_config().coverage.chunk_timeframe,
            Duration::from_secs(3600)
        );
        assert_eq!(config.sync_config().queue, SyncConfig::default().queue);
    }

    #[test]
    fn broken_config_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_NAME);
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            LedgerSyncConfig::load(&path),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            LedgerSyncConfig::load(&dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn paths_live_in_the_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("nested").join("data");
        let config = LedgerSyncConfig::create_unconnected(Network::Testnet, Some(data_dir.clone()));

        assert_eq!(config.get_data_dir().unwrap().to_path_buf(), data_dir);
        assert!(data_dir.is_dir());
        assert_eq!(
            config.get_log_path().unwrap().to_path_buf(),
            data_dir.join(DEFAULT_LOGFILE_NAME)
        );
        assert_eq!(
            config.get_config_path().unwrap().to_path_buf(),
            data_dir.join(DEFAULT_CONFIG_NAME)
        );
    }

    #[test]
    fn log_config_builds_in_the_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            LedgerSyncConfig::create_unconnected(Network::Mainnet, Some(dir.path().to_path_buf()));
        let log_config = config.get_log_config().unwrap();
        assert_eq!(log_config.root().level(), LevelFilter::Debug);
        assert_eq!(log_config.appenders().len(), 1);
    }

    #[tokio::test]
    async fn loaded_config_launches_an_engine() {
        use std::sync::Arc;

        use ledger_sync::{mocks::MockLedger, store::memory::MemoryStore, sync::SyncEngine};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_NAME);
        std::fs::write(&path, r#"{ "sync": { "scheduler": { "page_limit": 5 } } }"#).unwrap();
        let config = LedgerSyncConfig::load(&path).unwrap();
        assert_eq!(config.sync_config().scheduler.page_limit, 5);

        let engine = SyncEngine::launch(
            config.sync_config().clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(MockLedger::new()),
            None,
        )
        .await
        .unwrap();
        engine.shutdown().await;
    }
}

//! Top-level configuration (spec §0.2 / §6): a serde-decoded tree where
//! every field has a default, so `{}` is always a valid configuration file.
//! Grounded on the teacher's `src/configuration/configuration.rs`
//! (`ProxyConfiguration`/`LoggingConfiguration`), generalised from the
//! proxy's receiver/jrpc/file sections to the bridge's server/cec/network
//! sections named by spec.md §6.

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Server,
    Client,
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
pub struct ServerConfiguration {
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub mode: Option<Mode>,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl std::default::Default for ServerConfiguration {
    fn default() -> Self {
        ServerConfiguration {
            interface: None,
            host: None,
            mode: None,
            port: default_port(),
        }
    }
}

impl ServerConfiguration {
    /// Derives the effective mode: explicit `mode` wins; otherwise exactly
    /// one of `interface`/`host` must be set (spec §6: "error if both
    /// given").
    pub fn resolve_mode(&self) -> Result<Mode, crate::BridgeError> {
        if let Some(mode) = self.mode {
            return Ok(mode);
        }
        match (&self.interface, &self.host) {
            (Some(_), None) => Ok(Mode::Server),
            (None, Some(_)) => Ok(Mode::Client),
            (Some(_), Some(_)) => Err(crate::BridgeError::Fatal(String::from(
                "both interface and host given; specify only one or set mode explicitly",
            ))),
            (None, None) => Err(crate::BridgeError::Fatal(String::from(
                "neither interface nor host given; nothing to bind or connect to",
            ))),
        }
    }

    pub fn bind_address(&self) -> String {
        self.interface
            .clone()
            .unwrap_or_else(default_bind_interface)
    }

    pub fn peer_host(&self) -> String {
        self.host.clone().unwrap_or_else(default_peer_host)
    }
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
pub struct CecConfiguration {
    #[serde(rename = "clientVersion", default = "default_client_version")]
    pub client_version: String,
    #[serde(rename = "deviceName", default = "default_device_name")]
    pub device_name: String,
    /// When set, `serve` drives `cec::FakeAdapter` instead of opening the
    /// native libcec connection (mirrors `CECConfiguration::fake_target`);
    /// used by integration tests, never set in production. The value
    /// itself is currently unused — presence alone switches the mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "fakeTarget", default)]
    pub fake_target: Option<String>,
}

impl std::default::Default for CecConfiguration {
    fn default() -> Self {
        CecConfiguration {
            client_version: default_client_version(),
            device_name: default_device_name(),
            fake_target: None,
        }
    }
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
pub struct NetworkConfiguration {
    #[serde(rename = "updatePeriodSecs", default = "default_update_period")]
    pub update_period_secs: u64,
    #[serde(rename = "scanIntervalSecs", default = "default_scan_interval")]
    pub scan_interval_secs: u64,
}

impl std::default::Default for NetworkConfiguration {
    fn default() -> Self {
        NetworkConfiguration {
            update_period_secs: default_update_period(),
            scan_interval_secs: default_scan_interval(),
        }
    }
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
pub struct LoggingConfiguration {
    #[serde(default = "logging_default_enabled")]
    pub enabled: bool,
    #[serde(default = "logging_default_level")]
    #[serde(deserialize_with = "deserialize_level")]
    #[serde(serialize_with = "serialize_level")]
    pub level: log::LevelFilter,
}

impl std::default::Default for LoggingConfiguration {
    fn default() -> Self {
        LoggingConfiguration {
            enabled: logging_default_enabled(),
            level: logging_default_level(),
        }
    }
}

#[derive(Debug, Default, serde::Deserialize, serde::Serialize)]
pub struct BridgeConfiguration {
    #[serde(default)]
    pub server: ServerConfiguration,
    #[serde(default)]
    pub cec: CecConfiguration,
    #[serde(default)]
    pub network: NetworkConfiguration,
    #[serde(default)]
    pub logging: LoggingConfiguration,
}

fn default_port() -> u16 {
    9526
}

fn default_bind_interface() -> String {
    String::from("0.0.0.0")
}

fn default_peer_host() -> String {
    String::from("127.0.0.1")
}

fn default_client_version() -> String {
    String::from("4.0.4")
}

fn default_device_name() -> String {
    String::from("cecbridge")
}

fn default_update_period() -> u64 {
    30
}

fn default_scan_interval() -> u64 {
    30
}

fn logging_default_enabled() -> bool {
    true
}

fn logging_default_level() -> log::LevelFilter {
    log::LevelFilter::Warn
}

fn deserialize_level<'de, D>(deserializer: D) -> Result<log::LevelFilter, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    match s.to_uppercase().as_str() {
        "OFF" => Ok(log::LevelFilter::Off),
        "ERROR" => Ok(log::LevelFilter::Error),
        "WARN" => Ok(log::LevelFilter::Warn),
        "INFO" => Ok(log::LevelFilter::Info),
        "DEBUG" => Ok(log::LevelFilter::Debug),
        "TRACE" => Ok(log::LevelFilter::Trace),
        _ => Err(serde::de::Error::custom(format!(
            "Invalid log level: {}",
            s
        ))),
    }
}

fn serialize_level<S>(level: &log::LevelFilter, s: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let level = format!("{}", level).to_uppercase();
    s.serialize_str(level.as_str())
}

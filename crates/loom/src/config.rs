//! Configuration for the Loom proxy.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::canary::{DEFAULT_MARKER, LEGACY_MARKER};
use crate::error::{LoomError, LoomResult};
use crate::pattern::PatternId;

/// Proxy configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoomConfig {
    /// Listener settings.
    pub server: ServerSettings,
    /// Upstream API settings.
    pub upstream: UpstreamSettings,
    /// Pattern selection and pattern inputs.
    pub patterns: PatternSettings,
    /// Canary marker settings.
    pub canary: CanarySettings,
    /// Turn grouping settings.
    pub turns: TurnSettings,
    /// Telemetry settings.
    pub telemetry: TelemetrySettings,
    /// External collaborator settings.
    pub collaborators: CollaboratorSettings,
}

impl LoomConfig {
    /// Create a new configuration builder.
    pub fn builder() -> LoomConfigBuilder {
        LoomConfigBuilder::default()
    }

    /// Load configuration from a TOML or JSON file.
    pub fn from_file(path: impl Into<PathBuf>) -> LoomResult<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| LoomError::config(format!("failed to read config file: {e}")))?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        match extension {
            "toml" => {
                toml::from_str(&content).map_err(|e| LoomError::config(format!("invalid TOML: {e}")))
            }
            "json" => serde_json::from_str(&content)
                .map_err(|e| LoomError::config(format!("invalid JSON: {e}"))),
            _ => Err(LoomError::config(format!(
                "unsupported config format: {extension}"
            ))),
        }
    }

    /// Apply environment variable overrides.
    ///
    /// Variables are prefixed with `LOOM_` and use uppercase `snake_case`.
    /// Unparsable values are ignored.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(addr) = var("LOOM_LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }

        if let Some(port) = var("LOOM_LISTEN_PORT").and_then(|p| p.parse().ok()) {
            self.server.listen_port = port;
        }

        if let Some(url) = var("LOOM_UPSTREAM_URL") {
            self.upstream.url = url;
        }

        if let Some(timeout) = var("LOOM_UPSTREAM_TIMEOUT").and_then(|t| parse_duration(&t).ok()) {
            self.upstream.timeout = timeout;
        }

        if let Some(pattern) = var("LOOM_DEFAULT_PATTERN") {
            self.patterns.default = Some(pattern);
        }

        if let Some(path) = var("LOOM_SOUL_PATH") {
            self.patterns.identity.soul_path = Some(PathBuf::from(path));
        }

        if let Some(name) = var("LOOM_MACHINE_NAME") {
            self.patterns.identity.machine_name = Some(name);
        }

        if let Some(marker) = var("LOOM_CANARY_MARKER") {
            self.canary.marker = marker;
        }

        if let Some(timeout) = var("LOOM_TURN_IDLE_TIMEOUT").and_then(|t| parse_duration(&t).ok()) {
            self.turns.idle_timeout = timeout;
        }

        if let Some(grace) = var("LOOM_TURN_GRACE_PERIOD").and_then(|t| parse_duration(&t).ok()) {
            self.turns.grace_period = grace;
        }

        if let Some(endpoint) = var("LOOM_OTLP_ENDPOINT") {
            self.telemetry.otlp_endpoint = Some(endpoint);
        }

        if let Some(level) = var("LOOM_LOG_LEVEL") {
            self.telemetry.log_level = level;
        }

        if let Some(url) = var("LOOM_REDIS_URL") {
            self.collaborators.redis_url = Some(url);
        }

        if let Some(url) = var("LOOM_MEMORY_URL") {
            self.collaborators.memory_url = Some(url);
        }

        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> LoomResult<()> {
        if self.upstream.url.is_empty() {
            return Err(LoomError::config("upstream.url is required"));
        }

        if !self.upstream.url.starts_with("http://") && !self.upstream.url.starts_with("https://")
        {
            return Err(LoomError::config(
                "upstream.url must start with http:// or https://",
            ));
        }

        if let Some(name) = &self.patterns.default {
            name.parse::<PatternId>().map_err(|_| {
                LoomError::config(format!("patterns.default names an unknown pattern: {name}"))
            })?;
        }

        if self.canary.marker.trim().is_empty() {
            return Err(LoomError::config("canary.marker must not be empty"));
        }

        for (name, value) in [
            ("upstream.timeout", self.upstream.timeout),
            ("turns.idle_timeout", self.turns.idle_timeout),
            ("turns.sweep_interval", self.turns.sweep_interval),
            (
                "collaborators.transcript_poll_interval",
                self.collaborators.transcript_poll_interval,
            ),
        ] {
            if value.is_zero() {
                return Err(LoomError::config(format!("{name} must be greater than zero")));
            }
        }

        if self.turns.grace_period > self.turns.idle_timeout {
            return Err(LoomError::config(
                "turns.grace_period must not exceed turns.idle_timeout",
            ));
        }

        if !(0.0..=1.0).contains(&self.telemetry.sample_ratio) {
            return Err(LoomError::config("telemetry.sample_ratio must be within 0..=1"));
        }

        Ok(())
    }

    /// The configured default pattern, if any.
    pub fn default_pattern(&self) -> Option<PatternId> {
        self.patterns
            .default
            .as_deref()
            .and_then(|name| name.parse().ok())
    }

    /// Every marker the canary extractor recognizes, primary first.
    pub fn canary_markers(&self) -> Vec<String> {
        let mut markers = vec![self.canary.marker.clone()];
        for legacy in &self.canary.legacy_markers {
            if !legacy.is_empty() && !markers.contains(legacy) {
                markers.push(legacy.clone());
            }
        }
        markers
    }
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address to bind to.
    pub listen_addr: String,
    /// Port to listen on.
    pub listen_port: u16,
    /// Maximum inbound body size in bytes.
    pub max_request_body_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            listen_port: 8080,
            max_request_body_size: 32 * 1024 * 1024,
        }
    }
}

/// Upstream API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamSettings {
    /// Base URL requests are forwarded to.
    pub url: String,
    /// Total time allowed for one upstream exchange, body included.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Time allowed to establish the connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Idle pooled connections kept per host.
    pub pool_max_idle_per_host: usize,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            url: "https://api.anthropic.com".to_string(),
            timeout: Duration::from_secs(600),
            connect_timeout: Duration::from_secs(10),
            pool_max_idle_per_host: 100,
        }
    }
}

/// Pattern selection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternSettings {
    /// Pattern used when a request names none. Absent means passthrough.
    pub default: Option<String>,
    /// Inputs of the identity pattern.
    pub identity: IdentitySettings,
    /// Inputs of the probe pattern.
    pub probe: ProbeSettings,
}

/// Inputs of the identity pattern. Prompt files hold opaque text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySettings {
    /// The identity's core prompt, woven into the `<eternal>` block.
    pub soul_path: Option<PathBuf>,
    /// System prompt used while the client is compacting.
    pub compact_system_path: Option<PathBuf>,
    /// Instructions that replace the client's summarization instructions.
    pub compact_instructions_path: Option<PathBuf>,
    /// Check-in text that replaces the client's continuation instruction.
    pub check_in_path: Option<PathBuf>,
    /// Machine name used when metadata carries none.
    pub machine_name: Option<String>,
    /// Remove known reminder noise from user messages.
    pub scrub_noise: bool,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            soul_path: None,
            compact_system_path: None,
            compact_instructions_path: None,
            check_in_path: None,
            machine_name: None,
            scrub_noise: true,
        }
    }
}

/// Inputs of the probe pattern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    /// Prompt files inserted as one system block.
    pub prompt_paths: Vec<PathBuf>,
    /// Text that replaces the client's continuation instruction.
    pub continuation_text: Option<String>,
}

/// Canary marker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CanarySettings {
    /// Marker that prefixes the metadata block.
    pub marker: String,
    /// Older markers still recognized and stripped.
    pub legacy_markers: Vec<String>,
}

impl Default for CanarySettings {
    fn default() -> Self {
        Self {
            marker: DEFAULT_MARKER.to_string(),
            legacy_markers: vec![LEGACY_MARKER.to_string()],
        }
    }
}

/// Turn grouping settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnSettings {
    /// Inactivity after which an open turn is force-finalized.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// How long a closed turn's tombstone absorbs stragglers.
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
    /// How often the sweeper runs.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10 * 60),
            grace_period: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(15),
        }
    }
}

/// Telemetry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Service name for traces and logs.
    pub service_name: String,
    /// Log filter directive.
    pub log_level: String,
    /// Emit JSON log lines.
    pub json_logs: bool,
    /// OTLP collector endpoint. Absent disables span export.
    pub otlp_endpoint: Option<String>,
    /// Trace sampling ratio.
    pub sample_ratio: f64,
    /// Record Prometheus metrics.
    pub metrics_enabled: bool,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            service_name: "loom".to_string(),
            log_level: "loom=info,warn".to_string(),
            json_logs: true,
            otlp_endpoint: None,
            sample_ratio: 1.0,
            metrics_enabled: true,
        }
    }
}

/// External collaborator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaboratorSettings {
    /// Redis URL for turn publishing and HUD context.
    pub redis_url: Option<String>,
    /// Memory search endpoint.
    pub memory_url: Option<String>,
    /// Maximum memories injected per request.
    pub memory_limit: usize,
    /// Tail transcript files named in request metadata.
    pub transcripts: bool,
    /// Stop tailing a transcript after this much request inactivity.
    #[serde(with = "humantime_serde")]
    pub transcript_idle_timeout: Duration,
    /// How often a tailed transcript is polled.
    #[serde(with = "humantime_serde")]
    pub transcript_poll_interval: Duration,
}

impl Default for CollaboratorSettings {
    fn default() -> Self {
        Self {
            redis_url: None,
            memory_url: None,
            memory_limit: 5,
            transcripts: false,
            transcript_idle_timeout: Duration::from_secs(5 * 60),
            transcript_poll_interval: Duration::from_millis(500),
        }
    }
}

/// Builder for `LoomConfig`.
#[derive(Debug, Default)]
pub struct LoomConfigBuilder {
    config: LoomConfig,
}

impl LoomConfigBuilder {
    /// Set the listen address.
    #[must_use]
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.server.listen_addr = addr.into();
        self
    }

    /// Set the listen port.
    #[must_use]
    pub fn listen_port(mut self, port: u16) -> Self {
        self.config.server.listen_port = port;
        self
    }

    /// Set the upstream URL.
    #[must_use]
    pub fn upstream_url(mut self, url: impl Into<String>) -> Self {
        self.config.upstream.url = url.into();
        self
    }

    /// Set the upstream timeout.
    #[must_use]
    pub fn upstream_timeout(mut self, timeout: Duration) -> Self {
        self.config.upstream.timeout = timeout;
        self
    }

    /// Set the default pattern.
    #[must_use]
    pub fn default_pattern(mut self, name: impl Into<String>) -> Self {
        self.config.patterns.default = Some(name.into());
        self
    }

    /// Set the canary marker.
    #[must_use]
    pub fn canary_marker(mut self, marker: impl Into<String>) -> Self {
        self.config.canary.marker = marker.into();
        self
    }

    /// Set the turn idle timeout.
    #[must_use]
    pub fn turn_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.turns.idle_timeout = timeout;
        self
    }

    /// Set the turn grace period.
    #[must_use]
    pub fn turn_grace_period(mut self, grace: Duration) -> Self {
        self.config.turns.grace_period = grace;
        self
    }

    /// Set the sweep interval.
    #[must_use]
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.turns.sweep_interval = interval;
        self
    }

    /// Set the identity pattern inputs.
    #[must_use]
    pub fn identity(mut self, identity: IdentitySettings) -> Self {
        self.config.patterns.identity = identity;
        self
    }

    /// Set the Redis URL.
    #[must_use]
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.config.collaborators.redis_url = Some(url.into());
        self
    }

    /// Set the OTLP endpoint.
    #[must_use]
    pub fn otlp_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.telemetry.otlp_endpoint = Some(endpoint.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> LoomResult<LoomConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Parses `500ms`, `30s`, `10m`, `2h`, or bare seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let parse = |n: &str| -> Result<u64, String> {
        n.trim()
            .parse()
            .map_err(|_| format!("invalid duration: {s}"))
    };

    if let Some(stripped) = s.strip_suffix("ms") {
        Ok(Duration::from_millis(parse(stripped)?))
    } else if let Some(stripped) = s.strip_suffix('s') {
        Ok(Duration::from_secs(parse(stripped)?))
    } else if let Some(stripped) = s.strip_suffix('m') {
        Ok(Duration::from_secs(parse(stripped)? * 60))
    } else if let Some(stripped) = s.strip_suffix('h') {
        Ok(Duration::from_secs(parse(stripped)? * 3600))
    } else {
        Ok(Duration::from_secs(parse(s)?))
    }
}

/// Serde adapter for human-readable durations.
mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = LoomConfig::default();
        assert_eq!(config.server.listen_port, 8080);
        assert_eq!(config.upstream.url, "https://api.anthropic.com");
        assert_eq!(config.turns.idle_timeout, Duration::from_secs(600));
        assert_eq!(config.turns.grace_period, Duration::from_secs(30));
        assert!(config.default_pattern().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = LoomConfig::builder()
            .listen_port(9000)
            .upstream_url("http://127.0.0.1:3000")
            .default_pattern("identity")
            .turn_idle_timeout(Duration::from_secs(60))
            .build()
            .unwrap();

        assert_eq!(config.server.listen_port, 9000);
        assert_eq!(config.upstream.url, "http://127.0.0.1:3000");
        assert_eq!(config.default_pattern(), Some(PatternId::Identity));
    }

    #[test]
    fn test_config_validation() {
        assert!(LoomConfig::builder().upstream_url("").build().is_err());
        assert!(LoomConfig::builder().upstream_url("ftp://x").build().is_err());
        assert!(LoomConfig::builder().default_pattern("alpah").build().is_err());
        assert!(LoomConfig::builder().canary_marker("  ").build().is_err());
        assert!(LoomConfig::builder()
            .turn_idle_timeout(Duration::ZERO)
            .build()
            .is_err());
        assert!(LoomConfig::builder()
            .turn_idle_timeout(Duration::from_secs(10))
            .turn_grace_period(Duration::from_secs(20))
            .build()
            .is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("LOOM_LISTEN_PORT", "9999"),
            ("LOOM_UPSTREAM_URL", "http://upstream:8000"),
            ("LOOM_DEFAULT_PATTERN", "probe"),
            ("LOOM_TURN_IDLE_TIMEOUT", "2m"),
            ("LOOM_REDIS_URL", "redis://localhost:6379"),
            ("LOOM_UPSTREAM_TIMEOUT", "not-a-duration"),
        ]
        .into_iter()
        .collect();

        let config = LoomConfig::default()
            .with_overrides_from(|key| vars.get(key).map(ToString::to_string));

        assert_eq!(config.server.listen_port, 9999);
        assert_eq!(config.upstream.url, "http://upstream:8000");
        assert_eq!(config.default_pattern(), Some(PatternId::Probe));
        assert_eq!(config.turns.idle_timeout, Duration::from_secs(120));
        assert_eq!(
            config.collaborators.redis_url.as_deref(),
            Some("redis://localhost:6379")
        );
        assert_eq!(config.upstream.timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_canary_markers() {
        let mut config = LoomConfig::default();
        config.canary.legacy_markers.push(DEFAULT_MARKER.to_string());

        let markers = config.canary_markers();
        assert_eq!(markers, vec![DEFAULT_MARKER.to_string(), LEGACY_MARKER.to_string()]);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_toml_config() {
        let toml = r#"
[server]
listen_port = 8100

[upstream]
url = "http://localhost:3000"
timeout = "120s"

[patterns]
default = "identity"

[patterns.identity]
machine_name = "alpha-pi"
scrub_noise = false

[turns]
idle_timeout = "5m"
grace_period = "10s"

[collaborators]
transcripts = true
transcript_poll_interval = "250ms"
"#;
        let config: LoomConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.listen_port, 8100);
        assert_eq!(config.upstream.timeout, Duration::from_secs(120));
        assert_eq!(config.default_pattern(), Some(PatternId::Identity));
        assert_eq!(config.patterns.identity.machine_name.as_deref(), Some("alpha-pi"));
        assert!(!config.patterns.identity.scrub_noise);
        assert_eq!(config.turns.idle_timeout, Duration::from_secs(300));
        assert_eq!(
            config.collaborators.transcript_poll_interval,
            Duration::from_millis(250)
        );
        assert!(config.validate().is_ok());
    }
}

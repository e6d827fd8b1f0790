//! `key=value` configuration file (spec §4.M), generalized from the original source's
//! `configuration.hpp`/`.cpp` typed-on-access pattern onto `FromStr`.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use rand::RngCore;
use tokio::fs;

#[derive(Debug)]
pub(crate) struct ConfigError(pub(crate) String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "configuration error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

/// In-memory view of the config file: a flat `key=value` table, read-only after startup
/// (spec §5, "shared-resource policy").
#[derive(Debug, Clone, Default)]
pub(crate) struct Config {
    values: HashMap<String, String>,
}

impl Config {
    /// Reads and parses a `key=value` file. `#` starts a full-line comment; blank lines are
    /// skipped; leading/trailing whitespace on key and value is trimmed.
    pub(crate) async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError(format!("reading {}: {e}", path.display())))?;

        let mut values = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            values.insert(key.trim().to_string(), value.trim().to_string());
        }

        Ok(Config { values })
    }

    /// Builds the default configuration table (spec §6) with a freshly random `server-salt`,
    /// writes it to `path`, and returns the resulting `Config`.
    pub(crate) async fn generate_default(path: &Path) -> Result<Self, ConfigError> {
        let mut salt_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut salt_bytes);
        let salt = salt_bytes.iter().map(|b| format!("{b:02x}")).collect::<String>();

        let defaults: &[(&str, &str)] = &[
            ("address", "localhost"),
            ("port", "8080"),
            ("ssl-port", "8081"),
            ("ssl-certificate", "server.crt"),
            ("ssl-private-key", "server.key"),
            ("www-root", "www-root"),
            ("default-document", "index.html"),
            ("user-agent-whitelist", "*"),
            ("user-agent-blacklist", ""),
            ("upgrade-insecure-requests", "true"),
            ("trace-allowed", "false"),
            ("head-allowed", "false"),
            ("options-allowed", "true"),
            ("authenticate-over-non-ssl", "false"),
            ("max-uri-length", "4096"),
            ("max-header-length", "8192"),
            ("max-header-count", "25"),
            ("max-request-content-length", "4194304"),
            ("request-content-read-timeout", "300"),
            ("request-post-content-read-timeout", "30"),
            ("connection-ssl-handshake-timeout", "20"),
            ("connection-keep-alive-timeout", "20"),
            ("max-connections-per-client", "8"),
            ("provide-server-info", "false"),
            ("static-response-headers", ""),
            ("threads", "128"),
            ("mime.html", "text/html"),
            ("handler.html", "get-file-handler"),
            ("mime.htm", "text/html"),
            ("handler.htm", "get-file-handler"),
            ("mime.css", "text/css"),
            ("handler.css", "get-file-handler"),
            ("mime.js", "application/javascript"),
            ("handler.js", "get-file-handler"),
            ("mime.json", "application/json"),
            ("handler.json", "get-file-handler"),
            ("mime.txt", "text/plain"),
            ("handler.txt", "get-file-handler"),
            ("mime.png", "image/png"),
            ("handler.png", "get-file-handler"),
            ("mime.jpg", "image/jpeg"),
            ("handler.jpg", "get-file-handler"),
            ("mime.jpeg", "image/jpeg"),
            ("handler.jpeg", "get-file-handler"),
            ("mime.gif", "image/gif"),
            ("handler.gif", "get-file-handler"),
            ("mime.ico", "image/x-icon"),
            ("handler.ico", "get-file-handler"),
            ("mime.svg", "image/svg+xml"),
            ("handler.svg", "get-file-handler"),
        ];

        let mut values: HashMap<String, String> = defaults
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        values.insert("server-salt".to_string(), salt);

        let mut body = String::new();
        body.push_str("# originserve configuration - generated on first run\n");
        let mut keys: Vec<&String> = values.keys().collect();
        keys.sort();
        for key in keys {
            body.push_str(key);
            body.push('=');
            body.push_str(&values[key]);
            body.push('\n');
        }

        fs::write(path, body)
            .await
            .map_err(|e| ConfigError(format!("writing {}: {e}", path.display())))?;

        Ok(Config { values })
    }

    /// Synchronously reads just the `threads` key out of the configuration file that
    /// [`crate::app::run`] will later load asynchronously, so `main` can size the Tokio runtime
    /// before any async machinery exists to run a real `Config::load` on. Falls back to the
    /// documented default (128) whenever the file is missing, unreadable, or doesn't set the key
    /// — the async startup path re-derives the real value anyway and will report any config
    /// error properly once the runtime is up.
    pub(crate) fn peek_threads(explicit_path: Option<&str>) -> usize {
        const DEFAULT: usize = 128;
        let path = explicit_path
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|| std::path::PathBuf::from("originserve.config"));
        let Ok(text) = std::fs::read_to_string(&path) else {
            return DEFAULT;
        };
        for line in text.lines() {
            let line = line.trim();
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            if key.trim() == "threads" {
                if let Ok(n) = value.trim().parse() {
                    return n;
                }
            }
        }
        DEFAULT
    }

    pub(crate) fn get<T: FromStr>(&self, key: &str) -> Option<T> {
        self.values.get(key).and_then(|v| v.parse().ok())
    }

    pub(crate) fn get_or<T: FromStr>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    pub(crate) fn require<T: FromStr>(&self, key: &str) -> Result<T, ConfigError> {
        self.values
            .get(key)
            .ok_or_else(|| ConfigError(format!("missing required key `{key}`")))?
            .parse()
            .map_err(|_| ConfigError(format!("key `{key}` could not be parsed")))
    }

    pub(crate) fn raw(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    /// Builds [`ServerLimits`](crate::limits::ServerLimits) from the relevant config keys.
    pub(crate) fn derive_server_limits(&self) -> crate::limits::ServerLimits {
        let static_response_headers = self
            .raw("static-response-headers")
            .unwrap_or("")
            .split('|')
            .map(str::to_string)
            .filter(|s| !s.is_empty())
            .collect();

        crate::limits::ServerLimits {
            max_connections_per_client: self.get_or("max-connections-per-client", 8),
            threads: self.get_or("threads", 128),
            provide_server_info: self.get_or("provide-server-info", false),
            static_response_headers,
        }
    }

    /// Builds [`ConnLimits`](crate::limits::ConnLimits) from the relevant config keys.
    pub(crate) fn derive_conn_limits(&self) -> crate::limits::ConnLimits {
        crate::limits::ConnLimits {
            ssl_handshake_timeout: std::time::Duration::from_secs(
                self.get_or("connection-ssl-handshake-timeout", 20),
            ),
            keep_alive_timeout: std::time::Duration::from_secs(
                self.get_or("connection-keep-alive-timeout", 20),
            ),
        }
    }

    /// Builds [`ReqLimits`](crate::limits::ReqLimits) from the relevant config keys.
    pub(crate) fn derive_req_limits(&self) -> crate::limits::ReqLimits {
        crate::limits::ReqLimits {
            max_uri_length: self.get_or("max-uri-length", 4096),
            max_header_length: self.get_or("max-header-length", 8192),
            max_header_count: self.get_or("max-header-count", 25),
            max_request_content_length: self.get_or("max-request-content-length", 4_194_304),
            request_content_read_timeout: std::time::Duration::from_secs(
                self.get_or("request-content-read-timeout", 300),
            ),
            request_post_content_read_timeout: std::time::Duration::from_secs(
                self.get_or("request-post-content-read-timeout", 30),
            ),
        }
    }

    /// Every `mime.<ext>` key whose matching `handler.<ext>` is `get-file-handler` (spec §4.O).
    pub(crate) fn mime_table(&self) -> HashMap<String, String> {
        let mut table = HashMap::new();
        for (key, value) in &self.values {
            let Some(ext) = key.strip_prefix("mime.") else {
                continue;
            };
            if self.raw(&format!("handler.{ext}")) == Some("get-file-handler") {
                table.insert(ext.to_lowercase(), value.clone());
            }
        }
        table
    }
}

#[cfg(test)]
impl Config {
    /// Builds a `Config` directly from `key=value` pairs, for tests outside this module (e.g.
    /// `dispatch`'s integration tests) that need specific overrides without a real file on disk.
    pub(crate) fn for_tests(pairs: &[(&str, &str)]) -> Self {
        Config {
            values: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comments_and_blank_lines() {
        let mut values = HashMap::new();
        let text = "# comment\n\nport=8080\nwww-root = www-root \n";
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (k, v) = line.split_once('=').unwrap();
            values.insert(k.trim().to_string(), v.trim().to_string());
        }
        let cfg = Config { values };
        assert_eq!(cfg.get::<u16>("port"), Some(8080));
        assert_eq!(cfg.raw("www-root"), Some("www-root"));
    }

    #[test]
    fn get_or_falls_back() {
        let cfg = Config::default();
        assert_eq!(cfg.get_or::<u64>("max-request-content-length", 4_194_304), 4_194_304);
    }

    #[test]
    fn require_fails_on_missing_key() {
        let cfg = Config::default();
        assert!(cfg.require::<u16>("port").is_err());
    }
}

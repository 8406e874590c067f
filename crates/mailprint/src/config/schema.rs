use serde::{Deserialize, Serialize};

use crate::secrets::SecretSource;

pub const DEFAULT_PRINTER: &str = "default";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Only messages from these senders are fetched, in this order.
    #[serde(default)]
    pub allowed_senders: Vec<String>,
    #[serde(default = "default_true")]
    pub delete_printed: bool,
    /// Printer name passed to `lp -d`, or `"default"` for the system default.
    #[serde(default = "default_printer")]
    pub printer: String,
    #[serde(default)]
    pub print_flags: Vec<String>,
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Wipe state and stored tokens on the next launch.
    #[serde(default)]
    pub reset: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_reauth_interval")]
    pub reauth_interval_secs: u64,
    #[serde(default = "default_query_skew")]
    pub query_skew_secs: u64,
    #[serde(default = "default_callback_port")]
    pub callback_port: u16,
    #[serde(default)]
    pub rasterize_pdf: bool,
    /// Where extracted attachments are written. System temp dir when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_dir: Option<String>,
    #[serde(default)]
    pub google: GoogleSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imap: Option<ImapSettings>,
}

fn default_true() -> bool {
    true
}

fn default_printer() -> String {
    DEFAULT_PRINTER.to_string()
}

fn default_provider() -> String {
    "google".to_string()
}

fn default_poll_interval() -> u64 {
    60
}

fn default_reauth_interval() -> u64 {
    12 * 60 * 60
}

fn default_query_skew() -> u64 {
    45
}

fn default_callback_port() -> u16 {
    8080
}

impl Default for Config {
    fn default() -> Self {
        Self {
            allowed_senders: Vec::new(),
            delete_printed: true,
            printer: default_printer(),
            print_flags: Vec::new(),
            provider: default_provider(),
            reset: false,
            poll_interval_secs: default_poll_interval(),
            reauth_interval_secs: default_reauth_interval(),
            query_skew_secs: default_query_skew(),
            callback_port: default_callback_port(),
            rasterize_pdf: false,
            download_dir: None,
            google: GoogleSettings::default(),
            imap: None,
        }
    }
}

impl Config {
    /// Configured senders with blank entries dropped, order preserved.
    pub fn senders(&self) -> Vec<String> {
        self.allowed_senders
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }
}

/// OAuth client registration for the Google provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleSettings {
    #[serde(default = "default_google_client_id")]
    pub client_id: SecretSource,
    #[serde(default = "default_google_client_secret")]
    pub client_secret: SecretSource,
}

pub const GOOGLE_CLIENT_ID_ENV: &str = "MAILPRINT_GOOGLE_CLIENT_ID";
pub const GOOGLE_CLIENT_SECRET_ENV: &str = "MAILPRINT_GOOGLE_CLIENT_SECRET";

fn default_google_client_id() -> SecretSource {
    SecretSource::env(GOOGLE_CLIENT_ID_ENV)
}

fn default_google_client_secret() -> SecretSource {
    SecretSource::env(GOOGLE_CLIENT_SECRET_ENV)
}

impl Default for GoogleSettings {
    fn default() -> Self {
        Self {
            client_id: default_google_client_id(),
            client_secret: default_google_client_secret(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImapSettings {
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    pub username: String,
    #[serde(default = "default_folder")]
    pub folder: String,
    #[serde(default)]
    pub auth: ImapAuth,
    /// Used when `auth` is `password`.
    #[serde(default)]
    pub password: SecretSource,
}

fn default_imap_port() -> u16 {
    993
}

fn default_folder() -> String {
    "INBOX".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImapAuth {
    #[default]
    Password,
    /// XOAUTH2 with the Google OAuth client and a vault-backed token.
    Oauth2,
}

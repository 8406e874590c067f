pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod extract;
pub mod print;
pub mod provider;
pub mod scheduler;
pub mod secrets;
pub mod state;
pub mod storage;
pub mod vault;

pub use auth::{AuthError, Credentials, Token, TokenIssuer};
pub use config::{load_config, Config};
pub use context::AppContext;
pub use error::{ConfigError, MailprintError, Result, StateError};
pub use extract::{ExtractedFile, Extractor};
pub use print::{LpPrinter, PrintError, PrintSink};
pub use provider::{FetchError, MailProvider, ProviderKind};
pub use scheduler::{Clock, PollScheduler, SystemClock};
pub use secrets::{SecretError, SecretSource};
pub use state::StateStore;
pub use vault::{EncryptionKey, TokenStore, VaultError};

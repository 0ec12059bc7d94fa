pub mod claudecode;
pub mod config;
pub mod cooldown;
pub mod credential;
pub mod dispatch;
pub mod pricing;
pub mod router;
pub mod selector;
pub mod upstream;
pub mod usage;

pub use config::{ConfigHandle, ConfigSnapshot, ModelAlias, Pricing, ProviderRecord};
pub use cooldown::{CooldownConfig, CooldownManager};
pub use credential::{CredentialPool, OAuthBroker, spawn_refresher};
pub use dispatch::{Dispatcher, DispatchReply, IngressRequest};
pub use router::Router;
pub use upstream::{UpstreamClient, WreqUpstreamClient};

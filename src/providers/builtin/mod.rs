pub mod files;
pub mod log;
pub mod network;
pub mod process;
pub mod status;
pub mod store;
pub mod transfer;

use std::sync::Arc;

use crate::action::ActionKind;
use crate::config::ProvidersConfig;
use crate::providers::Provider;

pub use files::{FileReadProvider, FileWriteProvider};
pub use log::LogProvider;
pub use network::NetworkFetchProvider;
pub use process::SpawnProcessProvider;
pub use status::StatusCheckProvider;
pub use store::{ReadDbProvider, WriteDbProvider};
pub use transfer::TokenTransferProvider;

/// Builds the builtin provider for `kind`.
///
/// The match is exhaustive over the builtin kinds: adding a kind
/// without a provider does not compile. `Custom` kinds have no builtin.
pub fn builtin_provider(kind: &ActionKind, config: &ProvidersConfig) -> Option<Arc<dyn Provider>> {
    let provider: Arc<dyn Provider> = match kind {
        ActionKind::Log => Arc::new(LogProvider),
        ActionKind::StatusCheck => Arc::new(StatusCheckProvider::new(config)),
        ActionKind::FileRead => Arc::new(FileReadProvider::new(&config.root)),
        ActionKind::FileWrite => Arc::new(FileWriteProvider::new(&config.root)),
        ActionKind::NetworkFetch => Arc::new(NetworkFetchProvider::new(&config.network)),
        ActionKind::ReadDb => Arc::new(ReadDbProvider::new(&config.store)),
        ActionKind::WriteDb => Arc::new(WriteDbProvider::new(&config.store)),
        ActionKind::SpawnProcess => {
            Arc::new(SpawnProcessProvider::new(&config.process, &config.root))
        }
        ActionKind::TokenTransfer => {
            Arc::new(TokenTransferProvider::new(&config.transfer, &config.network))
        }
        ActionKind::Custom(_) => return None,
    };
    Some(provider)
}

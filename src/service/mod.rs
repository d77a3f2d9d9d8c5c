pub mod chain_client;
pub mod custody_wallet;
pub mod deposit_scanner;
pub mod evm_client;
pub mod sweep_worker;

pub use chain_client::{ChainClient, FeeData, TxSpec};
pub use custody_wallet::CustodyWalletService;
pub use deposit_scanner::{DepositScanner, ScanReport};
pub use evm_client::EvmChainClient;
pub use sweep_worker::{SweepOutcome, SweepReport, SweepWorker};

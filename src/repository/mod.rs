pub mod deposit_repository;
pub mod ledger_repository;
pub mod wallet_address_repository;

pub use deposit_repository::{DepositRepository, PgDepositRepository};
pub use ledger_repository::{LedgerRepository, PgLedgerRepository};
pub use wallet_address_repository::{
    PgWalletAddressRepository, UserWalletAddress, WalletAddressRepository,
};

//! Domain 模块
//!
//! 托管核心的领域模型：网络配置、地址派生、充值状态机、资金流水

pub mod deposit;
pub mod derivation;
pub mod erc20;
pub mod ledger;
pub mod network;

// 重新导出常用类型
pub use deposit::{Asset, Deposit, DepositStatus, NewDeposit, SweepResolution};
pub use derivation::{derive_index, DerivedWallet, MasterWallet};
pub use ledger::{LedgerEntry, LedgerKind};
pub use network::{AddressFormat, NetworkConfig, NetworkRegistry};

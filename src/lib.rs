//! IronCustody - 托管式多链充值归集
//!
//! 单一主种子派生全部用户充值地址；扫描器检测入账，归集器把资金转入金库。

pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod repository;
pub mod service;

// 重新导出常用类型
pub use error::{CustodyError, CustodyResult};

pub mod prelude {
    pub use crate::{
        config::Config,
        domain::{Asset, Deposit, DepositStatus, MasterWallet, NetworkConfig, NetworkRegistry},
        error::{CustodyError, CustodyResult},
        service::{ChainClient, CustodyWalletService, DepositScanner, SweepWorker},
    };
}

//! IronCustody 主入口
//!
//! 默认启动每条 EVM 网络的扫描器与归集器，Ctrl-C 优雅停止。
//! `ironcustody issue-address <user_id> <network>` 发放单个充值地址后退出。

use std::sync::Arc;

use anyhow::{Context, Result};
use ironcustody::{
    config::Config,
    domain::{AddressFormat, MasterWallet},
    infrastructure::{
        db::init_pool,
        encryption::{EncryptionKey, SecretCipher},
        logging::init_logging,
    },
    repository::{
        DepositRepository, LedgerRepository, PgDepositRepository, PgLedgerRepository,
        PgWalletAddressRepository, WalletAddressRepository,
    },
    service::{ChainClient, CustodyWalletService, DepositScanner, EvmChainClient, SweepWorker},
};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载环境变量与配置文件
    dotenvy::dotenv().ok();
    let config_path = std::env::var("CONFIG_PATH").ok();
    let config = Config::from_env_and_file(config_path.as_deref())?;

    // 2. 初始化日志
    let _log_guard = init_logging(&config.logging)?;

    // 3. 秘密缺失或无效直接拒绝启动
    config.validate().context("Invalid configuration")?;

    let master = Arc::new(
        MasterWallet::from_mnemonic(
            &config.custody.master_mnemonic,
            &config.custody.mnemonic_passphrase,
        )
        .context("Failed to load master wallet")?,
    );
    let cipher = Arc::new(SecretCipher::new(EncryptionKey::from_config_str(
        &config.custody.encryption_key,
    )?));
    let registry = Arc::new(config.network_registry());

    tracing::info!(
        master_fingerprint = %master.fingerprint(),
        networks = ?registry.list().iter().map(|n| n.key.as_str()).collect::<Vec<_>>(),
        "Starting IronCustody"
    );

    // 4. 连接数据库
    let pool = init_pool(&config.database).await?;
    tracing::info!("Database connected");

    // 5. 运行数据库迁移
    if std::env::var("SKIP_MIGRATIONS").is_err() {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Database migrations failed")?;
        tracing::info!("Database migrations completed");
    } else {
        tracing::info!("Database migrations skipped (SKIP_MIGRATIONS=1)");
    }

    let deposits: Arc<dyn DepositRepository> = Arc::new(PgDepositRepository::new(pool.clone()));
    let addresses: Arc<dyn WalletAddressRepository> =
        Arc::new(PgWalletAddressRepository::new(pool.clone()));
    let ledger: Arc<dyn LedgerRepository> = Arc::new(PgLedgerRepository::new(pool.clone()));
    let wallets = Arc::new(CustodyWalletService::new(
        master,
        cipher,
        registry.clone(),
        addresses.clone(),
    ));

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("issue-address") {
        let (Some(user_id), Some(network)) = (args.get(1), args.get(2)) else {
            anyhow::bail!("usage: ironcustody issue-address <user_id> <network>");
        };
        let record = wallets.issue_address(user_id, network).await?;
        println!("{}", record.address);
        pool.close().await;
        return Ok(());
    }

    // 6. 每条网络启动扫描器 + 归集器
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    for network in registry.list() {
        if network.address_format != AddressFormat::Evm {
            tracing::warn!(
                network = %network.key,
                "No chain client for this address format, network not scanned"
            );
            continue;
        }

        let client: Arc<dyn ChainClient> = Arc::new(EvmChainClient::new(
            &network.key,
            &network.rpc_url,
            network.chain_id,
        )?);
        let treasury = wallets.treasury(&network.key)?;
        tracing::info!(
            network = %network.key,
            treasury = %treasury.address,
            "Network pipeline starting"
        );

        let scanner = DepositScanner::new(
            network.clone(),
            client.clone(),
            deposits.clone(),
            addresses.clone(),
            &treasury.address,
            config.scanner.clone(),
        );
        tasks.push(tokio::spawn(scanner.run(shutdown_rx.clone())));

        let sweeper = SweepWorker::new(
            network.clone(),
            client,
            deposits.clone(),
            ledger.clone(),
            wallets.clone(),
            config.sweeper.clone(),
        );
        tasks.push(tokio::spawn(sweeper.run(shutdown_rx.clone())));
    }

    if tasks.is_empty() {
        anyhow::bail!("No network has a chain client, nothing to run");
    }

    // 7. 等待停止信号，让进行中的区块 / 归集完成
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received, finishing in-flight work");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = ?e, "Background task panicked");
        }
    }

    pool.close().await;
    tracing::info!("IronCustody stopped");
    Ok(())
}

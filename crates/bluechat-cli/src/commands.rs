//! Command handlers for the BlueChat CLI

use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tracing::info;

use bluechat_core::{
    ConnectionEngine, DeviceRegistry, DiscoveryController, PeerDevice, RadioAdapter,
    RegistrySnapshot, SocketFactory,
};
use bluechat_platform::TcpRadio;

use crate::cli::{Backend, Cli, Commands};
use crate::config::AppConfig;
use crate::coordinator::{ChatCoordinator, QUIT_COMMAND};
use crate::error::Result;

/// Radio and socket factory for one backend
struct Platform {
    radio: Arc<dyn RadioAdapter>,
    factory: Arc<dyn SocketFactory>,
}

impl Platform {
    async fn open(backend: Backend, config: &AppConfig) -> Result<Self> {
        match backend {
            Backend::Tcp => {
                let radio = TcpRadio::new(config.tcp.clone());
                Ok(Self {
                    radio: radio.clone(),
                    factory: radio,
                })
            }
            Backend::Bluez => Self::open_bluez().await,
        }
    }

    #[cfg(all(feature = "bluez", target_os = "linux"))]
    async fn open_bluez() -> Result<Self> {
        let radio = bluechat_platform::BluezRadio::new().await?;
        Ok(Self {
            radio: radio.clone(),
            factory: radio,
        })
    }

    #[cfg(not(all(feature = "bluez", target_os = "linux")))]
    async fn open_bluez() -> Result<Self> {
        Err(crate::error::CliError::BackendUnavailable(
            "built without the `bluez` feature".to_string(),
        ))
    }
}

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, mut config: AppConfig) -> Result<()> {
        if let Some(addr) = &cli.listen_addr {
            config.tcp.listen_addr = addr.clone();
            config.validate()?;
        }

        let platform = Platform::open(cli.backend, &config).await?;
        let discovery = DiscoveryController::new(
            platform.radio.clone(),
            DeviceRegistry::new(),
            config.engine.clone(),
        );
        let engine = ConnectionEngine::new(platform.factory.clone(), discovery, config.engine.clone())?;

        match cli.command {
            Commands::Scan { seconds, json } => {
                let window = Duration::from_secs(seconds.unwrap_or(config.cli.scan_seconds));
                Self::handle_scan_command(&engine, window, json).await
            }
            Commands::Paired { json } => Self::handle_paired_command(&engine, json).await,
            Commands::Listen => Self::handle_listen_command(engine, &config).await,
            Commands::Connect { address } => {
                Self::handle_connect_command(engine, &config, address).await
            }
        }
    }

    /// Scan for a fixed window, printing the registry whenever it changes
    async fn handle_scan_command(engine: &ConnectionEngine, window: Duration, json: bool) -> Result<()> {
        let discovery = engine.discovery();
        let mut snapshots = discovery.registry().subscribe();
        discovery.start_discovery().await?;
        info!("Scanning for {:?}", window);

        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);
        Self::print_snapshot(&snapshots.borrow_and_update().clone(), json)?;

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = snapshots.borrow_and_update().clone();
                    Self::print_snapshot(&snapshot, json)?;
                }
            }
        }

        discovery.stop_discovery().await;
        Ok(())
    }

    async fn handle_paired_command(engine: &ConnectionEngine, json: bool) -> Result<()> {
        let discovery = engine.discovery();
        discovery.ensure_radio_ready().await?;
        discovery.refresh_paired_devices().await?;

        let paired = discovery.registry().snapshot().paired;
        if json {
            println!("{}", serde_json::to_string_pretty(&paired)?);
        } else if paired.is_empty() {
            println!("No bonded devices");
        } else {
            for device in &paired {
                println!("  {}", device);
            }
        }
        Ok(())
    }

    async fn handle_listen_command(engine: ConnectionEngine, config: &AppConfig) -> Result<()> {
        println!(
            "Waiting for a peer on {} (type {} to leave)",
            config.engine.service, QUIT_COMMAND
        );
        let events = engine.listen();
        Self::chat(engine, events, config).await
    }

    async fn handle_connect_command(engine: ConnectionEngine, config: &AppConfig, address: String) -> Result<()> {
        // Prefer a known name for display when the address is bonded
        let device = match engine.discovery().refresh_paired_devices().await {
            Ok(()) => engine
                .discovery()
                .registry()
                .snapshot()
                .find(&address)
                .cloned()
                .unwrap_or_else(|| PeerDevice::new(None, address.clone())),
            Err(_) => PeerDevice::new(None, address.clone()),
        };

        println!("Connecting to {} (type {} to leave)", device, QUIT_COMMAND);
        let events = engine.dial(device);
        Self::chat(engine, events, config).await
    }

    async fn chat(
        engine: ConnectionEngine,
        events: bluechat_core::EventStream,
        config: &AppConfig,
    ) -> Result<()> {
        let stdin = BufReader::new(tokio::io::stdin());
        let mut stdout = tokio::io::stdout();
        let state = ChatCoordinator::new(engine, config.cli.clone())
            .run(events, stdin, &mut stdout)
            .await?;
        info!("Chat ended after {} messages", state.messages.len());
        Ok(())
    }

    fn print_snapshot(snapshot: &RegistrySnapshot, json: bool) -> Result<()> {
        if json {
            println!("{}", serde_json::to_string(snapshot)?);
            return Ok(());
        }

        println!("Paired ({}):", snapshot.paired.len());
        for device in &snapshot.paired {
            println!("  {}", device);
        }
        println!("Nearby ({}):", snapshot.scanned.len());
        for device in &snapshot.scanned {
            println!("  {}", device);
        }
        Ok(())
    }
}

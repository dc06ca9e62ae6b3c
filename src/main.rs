mod net;
mod protocol;
mod runtime;
mod storage;
mod utils;

use std::{env, sync::Arc};

use anyhow::Result;
use tracing::info;

use crate::runtime::Runtime;
use crate::utils::config::ConfigLoader;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut config_path = String::from("/etc/ironmap/config.ini");
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                config_path = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--config requires a path"))?;
            }
            other => {
                return Err(anyhow::anyhow!("unknown argument: {}", other));
            }
        }
    }

    let config = Arc::new(ConfigLoader::new(config_path).load()?);
    let runtime = Arc::new(Runtime::new(config));
    let mut tasks: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    info!("ironmap starting");
    runtime.clone().run(&mut tasks).await?;

    // Translate ctrl-c into a graceful shutdown.
    {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                runtime.begin_shutdown();
            }
        });
    }

    for task in tasks {
        task.await?;
    }
    info!("ironmap stopped");

    Ok(())
}

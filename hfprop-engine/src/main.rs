use hfprop_engine::config;
use hfprop_engine::logging;
use hfprop_engine::module::engine::EngineBuilder;
use hfprop_engine::module::handler::CommandHandler;
use hfprop_engine::module::scheduled::{ScheduledTaskConfig, ScheduledTaskManager};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::StreamExt;

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::read_config()?;

    let _logging_guard = logging::init_logging(&config.log_dir, "hfprop-engine", &config.log_level)?;

    tracing::info!("HF propagation engine starting...");
    tracing::info!("Config loaded from {}", config::config_path().display());

    let engine = EngineBuilder::new(config.clone())
        .build()
        .context("Failed to build propagation engine")?;

    // Log every notification the engine publishes
    let mut events = engine.event_stream();
    let event_logger = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => tracing::info!("event {}", json),
                    Err(e) => tracing::warn!("Failed to serialize event: {}", e),
                },
                Err(e) => tracing::warn!("Event logger lagging: {}", e),
            }
        }
    });

    let mut task_manager = ScheduledTaskManager::new(ScheduledTaskConfig::from(config), engine.clone());
    task_manager.start_all();
    tracing::info!("All scheduled tasks started successfully");

    let handler = CommandHandler::new(engine);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    tracing::info!("Console ready, type /help for commands");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("Failed to read console input")? {
                    Some(line) if line.trim().is_empty() => continue,
                    Some(line) => {
                        let response = handler.handle_line(&line).await;
                        if response.success {
                            println!("{}", response.message);
                        } else {
                            println!("error: {}", response.message);
                        }
                    }
                    None => {
                        tracing::info!("Console closed, running until interrupted");
                        tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
                        break;
                    }
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for ctrl-c")?;
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    task_manager.shutdown().await;
    event_logger.abort();
    tracing::info!("HF propagation engine stopped");

    Ok(())
}

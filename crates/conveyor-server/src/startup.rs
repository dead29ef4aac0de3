//! Server startup utilities.

use conveyor_config::AppConfig;
use tracing::info;

/// Prints the startup banner.
pub fn print_banner() {
    info!(r#"
   ______
  / ____/___  ____ _   _____  __  ______  _____
 / /   / __ \/ __ \ | / / _ \/ / / / __ \/ ___/
/ /___/ /_/ / / / / |/ /  __/ /_/ / /_/ / /
\____/\____/_/ /_/|___/\___/\__, /\____/_/
                           /____/
    "#);
}

/// Prints the effective process configuration.
pub fn print_startup_info(config: &AppConfig, queues: usize) {
    let separator = "=".repeat(60);
    info!("{}", separator);
    info!("Environment:   {}", config.app.environment);
    info!("Job store:     {}", config.store.backend);
    info!("Queues:        {} started", queues);
    for (name, processor) in config.processors.iter().filter(|(_, p)| p.enabled) {
        info!("  {:<18} concurrency {}", name, processor.concurrency);
    }
    info!(
        "Dead letters:  {}",
        if config.reliability.dead_letter_queue.enabled { "enabled" } else { "disabled" }
    );
    if config.metrics.enabled {
        info!("Metrics:       http://{}/metrics", config.metrics.listen_addr);
    }
    info!("{}", separator);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_print_banner_does_not_panic() {
        print_banner();
    }

    #[test]
    fn test_print_startup_info_does_not_panic() {
        let mut config = AppConfig::default();
        config.metrics.enabled = false;
        print_startup_info(&config, 2);
    }
}

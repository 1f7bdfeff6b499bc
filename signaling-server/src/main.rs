use log::info;
use simplelog::{Config, TermLogger, TerminalMode};

use callpeer_signaling_server::config::ServerConfig;
use callpeer_signaling_server::{routes, Registry};

#[tokio::main]
async fn main() {
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };
    if let Err(e) = TermLogger::init(config.log_level, Config::default(), TerminalMode::Mixed) {
        eprintln!("failed to initialize logging: {e:?}");
    }

    let registry = Registry::default();
    info!("signaling server listening on ws://{}/signaling", config.address);
    warp::serve(routes(registry)).run(config.address).await;
}

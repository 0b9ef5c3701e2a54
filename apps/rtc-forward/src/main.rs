use rtc_forward::cli::Cli;
use rtc_forward::config::Config;
use rtc_forward::session;
use rtc_forward::telemetry::logging;

#[tokio::main]
async fn main() {
    let cli = Cli::parse_normalized();

    let log_config = cli.logging.to_config().with_debug(cli.debug);
    if let Err(err) = logging::init(&log_config) {
        eprintln!("{err}");
        std::process::exit(1);
    }

    let config = match Config::from_cli(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    };

    let reason = session::run(config).await;
    let code = reason.exit_code();
    if code == 0 {
        eprintln!("{reason}");
    } else {
        eprintln!("Error: {reason}");
    }
    std::process::exit(code);
}

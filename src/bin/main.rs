use viewsync::{cli, config, telemetry};

fn main() {
    let cli = cli::parse_from(std::env::args_os());

    let _telemetry_guard = init_tracing(&cli);

    if let Err(e) = cli::run(cli) {
        tracing::error!("error: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing(cli: &cli::Cli) -> telemetry::TelemetryGuard {
    let path = cli::config_path(cli);
    let cfg = match config::load(&path) {
        Ok(cfg) => cfg,
        Err(_) => {
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };
    let telemetry_cfg = telemetry::TelemetryConfig::new(cli.verbose, cfg.logging);
    telemetry::init(telemetry_cfg)
}

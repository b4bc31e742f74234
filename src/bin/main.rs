use broker_rs::{cli, config, telemetry};

fn main() {
    let cli = cli::parse_from(std::env::args_os());

    let (cfg, config_err) = match config::load_or_init(cli.config.as_deref()) {
        Ok(cfg) => (cfg, None),
        Err(err) => {
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            (cfg, Some(err))
        }
    };
    let _telemetry_guard = telemetry::init(telemetry::TelemetryConfig::new(
        cli.verbose,
        cfg.logging.clone(),
    ));
    if let Some(err) = config_err {
        tracing::error!("error: {err}");
        std::process::exit(1);
    }

    match cli::run(cli, cfg) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!("error: {e}");
            std::process::exit(1);
        }
    }
}

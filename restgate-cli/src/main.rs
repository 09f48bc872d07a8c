mod cli;
mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cli::Cli;
use restgate_core::discovery::{ConsulCatalog, Discovery};
use restgate_core::dispatch::Dispatcher;
use restgate_core::routes::{Published, RoutePublisher};
use restgate_core::server::{self, AppState, TlsMode};
use restgate_core::session::{Session, SessionConfig, UnaryInvoker};

const BANNER: &str = r"
                      __                  __
   _______  _______ _/ /_ ____ _ ____ _ _/ /_ ___
  / ___/ _ \/ ___/ __  // __ `// __ `// __  // _ \
 / /  /  __(__  ) /_/ // /_/ // /_/ // /_/ //  __/
/_/   \___/____/\____/ \__, / \__,_/ \____/ \___/
                      /____/
";

#[tokio::main]
async fn main() {
    let code = run().await;
    process::exit(code);
}

async fn run() -> i32 {
    let cli = Cli::parse();

    let config = match config::load(&cli.config) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{message}");
            return 1;
        }
    };

    init_logging(&config, cli.verbosity());

    let instance_id = cli.instance_id();
    info!(instance_id = %instance_id, endpoint = %cli.grpc_endpoint, "starting");
    if let Some(ref fluentd) = cli.fluentd {
        // Log shipping is handled by an external collector.
        info!(fluentd = %fluentd, "log forwarding delegated to the fluentd agent");
    }
    if !cli.no_banner {
        print_banner();
    }

    let discovery: Arc<dyn Discovery> = Arc::new(ConsulCatalog::new(&cli.consul));
    let session = match Session::connect(SessionConfig::new(&cli.grpc_endpoint), Some(discovery))
        .await
    {
        Ok(session) => Arc::new(session),
        Err(e) => {
            error!(error = %e, "backend session could not be established");
            return 1;
        }
    };

    // Publish an empty surface, register the rebuild pipeline, then let the
    // first refresh fill it in. Startup fails hard if the initial schema is
    // unusable; later refresh failures only log and keep the current table.
    let publisher = Arc::new(RoutePublisher::new(Published::empty()));
    {
        let publisher = Arc::clone(&publisher);
        let registered = session.set_rebuild_callback(move |blob| {
            let published = Published::from_blob(blob)?;
            info!(routes = published.routes.len(), "publishing rebuilt route table");
            publisher.publish(published);
            Ok(())
        });
        if let Err(e) = registered {
            error!(error = %e, "failed to register rebuild callback");
            return 1;
        }
    }
    match session.refresh_schema().await {
        Ok(_) => info!(
            routes = publisher.snapshot().routes.len(),
            "initial route table built"
        ),
        Err(e) => {
            error!(error = %e, "initial schema fetch failed");
            return 1;
        }
    }
    session.spawn_refresh_task(Duration::from_secs(cli.schema_poll_seconds.max(1)));

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&publisher),
        Arc::clone(&session) as Arc<dyn UnaryInvoker>,
    ));

    let ui_root = PathBuf::from(&cli.work_dir).join("swagger_ui");
    let ui_root = if ui_root.is_dir() {
        Some(ui_root)
    } else {
        warn!(path = %ui_root.display(), "swagger UI assets not found, UI routes disabled");
        None
    };

    let app = server::router(
        AppState {
            dispatcher: Arc::clone(&dispatcher),
            publisher: Arc::clone(&publisher),
            ui_root,
        },
        &cli.swagger_url,
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.rest_port));
    let handle = axum_server::Handle::new();
    {
        let handle = handle.clone();
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                dispatcher.begin_shutdown();
                handle.graceful_shutdown(Some(Duration::from_secs(10)));
            }
        });
    }

    let served = match server::resolve_tls(&cli.enable_tls, &cli.key, &cli.cert) {
        TlsMode::Enabled { key, cert } => {
            let tls = match RustlsConfig::from_pem_file(&cert, &key).await {
                Ok(tls) => tls,
                Err(e) => {
                    error!(error = %e, "failed to load tls key material");
                    return 1;
                }
            };
            info!(port = cli.rest_port, "web server starting (tls)");
            axum_server::bind_rustls(addr, tls)
                .handle(handle)
                .serve(app.into_make_service())
                .await
        }
        TlsMode::Cleartext => {
            info!(port = cli.rest_port, "web server starting");
            axum_server::bind(addr)
                .handle(handle)
                .serve(app.into_make_service())
                .await
        }
    };

    match served {
        Ok(()) => {
            info!("stopped");
            0
        }
        Err(e) => {
            error!(error = %e, "web server failed");
            1
        }
    }
}

fn init_logging(config: &config::Config, verbosity: i8) {
    let base = match verbosity {
        i8::MIN..=-1 => "warn".to_string(),
        0 => config
            .logging
            .level
            .clone()
            .unwrap_or_else(|| "info".to_string()),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(base));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn print_banner() {
    for line in BANNER.trim_matches('\n').lines() {
        info!("{line}");
    }
    info!("(to stop: press Ctrl-C)");
}

use anyhow::Context;
use clap::Parser;

/// kurbisiod serves the generated REST API of a backend configuration
/// and drives its job pipeline.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// URL of the postgres database.
    #[clap(long = "database", env = "DATABASE_URL")]
    database_url: url::Url,
    /// Database password, substituted into the URL when set.
    #[clap(long = "database-password", env = "DATABASE_PASSWORD")]
    database_password: Option<String>,
    /// Path of the backend configuration JSON.
    #[clap(long = "config", env = "KURBISIO_CONFIG", default_value = "kurbisio.json")]
    config_path: String,
    /// SQL schema holding the generated tables.
    #[clap(long = "schema", env = "KURBISIO_SCHEMA", default_value = "kurbisio")]
    schema: String,
    /// The port to listen on for API requests.
    #[clap(long, default_value = "8080", env = "API_PORT")]
    api_port: u16,
    /// Create or migrate the SQL schema at startup.
    #[clap(long = "update-schema", env = "UPDATE_SCHEMA")]
    update_schema: bool,
}

fn main() -> anyhow::Result<()> {
    // Reasonable defaults for printing structured logs to stderr.
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    let args = Args::parse();
    tracing::info!(config = %args.config_path, schema = %args.schema, "starting");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    let mut database_url = args.database_url;
    if let Some(password) = &args.database_password {
        database_url
            .set_password(Some(password))
            .ok()
            .context("failed to set database password")?;
    }

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(16)
        .connect(database_url.as_str())
        .await
        .context("failed to connect to the database")?;

    let raw = std::fs::read_to_string(&args.config_path)
        .with_context(|| format!("failed to read {}", args.config_path))?;
    let config = models::BackendConfiguration::from_json(&raw)
        .context("failed to parse the backend configuration")?;

    let backend = backend::Builder::new(config, pool)?
        .schema(&args.schema)
        .update_schema(args.update_schema)
        .build()
        .await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        () = wait_for_signal().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let pipeline = backend.pipeline();
    let mut pipeline_rx = shutdown_rx.clone();
    let pipeline_task = tokio::spawn(async move {
        pipeline
            .serve(async move {
                let _ = pipeline_rx.changed().await;
            })
            .await;
    });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.api_port))
        .await
        .with_context(|| format!("failed to bind port {}", args.api_port))?;
    tracing::info!(port = args.api_port, "serving API");

    let mut serve_rx = shutdown_rx;
    axum::serve(listener, backend.router())
        .with_graceful_shutdown(async move {
            let _ = serve_rx.changed().await;
        })
        .await
        .context("server failed")?;

    pipeline_task.await.context("pipeline task failed")?;
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => (),
            _ = sigterm.recv() => (),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

use jobforge_api::config::AppConfig;
use jobforge_queue::HandlerRegistry;

#[tokio::main]
async fn main() {
    jobforge_observability::init();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "fatal configuration error");
            std::process::exit(1);
        }
    };

    // Handlers are supplied by the embedding deployment; the queue itself
    // only defines the dispatch contract. An empty registry still serves
    // the API, but claimed jobs will fail as handler_missing.
    let registry = HandlerRegistry::new();

    let bind_addr = config.bind_addr.clone();
    let app = jobforge_api::app::build_app(config, registry)
        .await
        .expect("failed to build application");

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {bind_addr}: {e}"));

    tracing::info!("listening on {}", listener.local_addr().unwrap());

    axum::serve(listener, app).await.unwrap();
}

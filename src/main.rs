use costnav::{EngineContext, QueryPipeline, Settings};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("configuration error: {}", err);
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone())),
        )
        .init();

    let question: String = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if question.trim().is_empty() {
        eprintln!("usage: costnav <question>");
        std::process::exit(2);
    }

    let context = match EngineContext::initialize(settings).await {
        Ok(context) => context,
        Err(err) => {
            eprintln!("startup error: {}", err);
            std::process::exit(1);
        }
    };

    let pipeline = QueryPipeline::new(std::sync::Arc::new(context));
    let response = pipeline.ask(&question).await;

    match serde_json::to_string_pretty(&response) {
        Ok(json) => println!("{}", json),
        Err(_) => println!("{}", response.answer),
    }
}

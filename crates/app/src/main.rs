#[tokio::main]
async fn main() {
    if let Err(error) = tumorscan_app::run_from_env().await {
        tracing::error!("{error:#}");
        eprintln!("tumorscan: {error:#}");
        std::process::exit(1);
    }
}

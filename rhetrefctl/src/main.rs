use clap::Parser;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    rhetrefctl::init_tracing();
    let cli = rhetrefctl::Cli::parse();
    if let Err(err) = rhetrefctl::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

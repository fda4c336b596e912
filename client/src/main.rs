use clap::Parser;
use client::http::HttpApi;
use client::network::Client;
use log::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Real-time server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Base URL of the HTTP API
    #[arg(short = 'a', long, default_value = "http://127.0.0.1:3000")]
    api: String,

    /// Run id to join
    #[arg(short = 'r', long, conflicts_with = "create")]
    run: Option<String>,

    /// Create a fresh run and join it
    #[arg(short = 'c', long)]
    create: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let http = HttpApi::new(&args.api);

    let run = match (args.run, args.create) {
        (Some(run_id), _) => http.get_run(&run_id).await?,
        (None, true) => http.create_run().await?,
        (None, false) => return Err("pass --run <id> to join a run or --create to start one".into()),
    };

    info!("Run {}", run.id);
    println!("Share this run id to play together: {}", run.id);
    println!("Commands: toggle <1|2> <cell>, mode <on|off>, show, quit");

    let client = Client::connect(&args.server, http, run).await?;
    client.run().await?;

    Ok(())
}

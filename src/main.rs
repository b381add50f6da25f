use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::info;

use slotserve::backend::StubBackend;
use slotserve::config::EngineConfig;
use slotserve::http_server;
use slotserve::logging;
use slotserve::server::Server;
use slotserve::tokenizer::{ByteCodec, HfCodec, TextCodec};
use slotserve::trace_reporter::FileReporter;

#[derive(Parser)]
#[command(name = "slotserve", about = "Slot-based continuous-batching inference scheduler")]
struct Args {
    /// Port to listen on
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Engine config JSON; defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of generation slots
    #[arg(long)]
    slots: Option<usize>,

    /// Total context size, divided across slots
    #[arg(long)]
    ctx_size: Option<usize>,

    /// Model directory holding tokenizer.json; a byte-level codec is used
    /// when omitted (scheduling demo against the reference backend)
    #[arg(long)]
    model_path: Option<String>,

    /// Enable request tracing and write trace JSON files to this directory
    #[arg(long)]
    trace_output_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    logging::init_default();

    let args = Args::parse();

    if let Some(ref trace_path) = args.trace_output_path {
        std::fs::create_dir_all(trace_path).expect("Failed to create trace output directory");
        fastrace::set_reporter(
            FileReporter::new(trace_path.clone()),
            fastrace::collector::Config::default(),
        );
        info!("Tracing enabled: output_dir={}", trace_path.display());
    }

    let mut config = match &args.config {
        Some(path) => {
            EngineConfig::from_file(path.to_str().expect("config path must be utf-8"))
                .expect("Failed to load engine config")
        }
        None => EngineConfig::default(),
    };
    if let Some(slots) = args.slots {
        config.n_slots = slots;
    }
    if let Some(ctx) = args.ctx_size {
        config.n_ctx = ctx;
    }

    let codec: Arc<dyn TextCodec> = match &args.model_path {
        Some(path) => {
            info!("Loading tokenizer from {}", path);
            Arc::new(HfCodec::from_file(path).expect("Failed to load tokenizer"))
        }
        None => {
            info!("No model path given, serving with the byte-level codec");
            Arc::new(ByteCodec)
        }
    };

    let backend = Box::new(StubBackend::new(
        codec.vocab_size(),
        config.n_slots,
        ByteCodec::EOS,
    ));

    info!(
        "Starting scheduler: n_slots={}, n_ctx={}, n_batch={}",
        config.n_slots, config.n_ctx, config.n_batch
    );
    let server = Arc::new(Server::start(config, backend, codec).expect("Failed to start server"));

    let app = http_server::build_app(server);

    let addr = format!("0.0.0.0:{}", args.port);
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind listen address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    if args.trace_output_path.is_some() {
        info!("Flushing pending traces...");
        fastrace::flush();
    }
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");
    info!("Shutdown signal received");
}

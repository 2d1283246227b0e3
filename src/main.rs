use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use voicebridge::asr::AsrClient;
use voicebridge::mt::Translator;
use voicebridge::pipeline::PipelineManager;
use voicebridge::session::SessionRegistry;
use voicebridge::transport::{self, AppState};
use voicebridge::tts::Synthesizer;
use voicebridge::{reaper, Config};

/// voicebridge - real-time two-party voice translation relay
#[derive(Parser)]
#[command(name = "voicebridge", version, about)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, env = "VOICEBRIDGE_LISTEN")]
    listen: Option<SocketAddr>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,voicebridge=info",
        1 => "info,voicebridge=debug",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::default();
    config.apply_env();
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    let config = Arc::new(config);

    let registry = Arc::new(SessionRegistry::new(
        config.idle.ended_grace,
        config.idle.session,
        config.idle.pending_session,
    ));
    let asr = Arc::new(AsrClient::new(config.asr.clone()));
    let translator = Arc::new(Translator::new(config.mt.clone()));
    let synthesizer = Arc::new(Synthesizer::new(config.tts.clone()));
    let pipelines = Arc::new(PipelineManager::new(
        Arc::clone(&registry),
        Arc::clone(&asr),
        translator,
        Arc::clone(&synthesizer),
        config.gate.clone(),
    ));

    reaper::spawn(
        Arc::clone(&registry),
        Arc::clone(&pipelines),
        asr,
        synthesizer,
        Arc::clone(&config),
    );

    let state = AppState {
        registry,
        pipelines,
        config: Arc::clone(&config),
    };
    let app = transport::router(state);

    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    tracing::info!(listen = %config.listen, "voicebridge listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}

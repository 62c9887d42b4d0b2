use clap::Parser;
use ostium::http::{FileSystemHandler, HttpServer};
use ostium::{Application, Runtime};

use std::path::PathBuf;
use std::process::ExitCode;

/// HTTP/1.1 file server on a single-threaded edge-triggered reactor.
#[derive(Parser)]
#[command(name = "ostium", version)]
struct Args {
    /// TCP port to bind.
    #[arg(default_value_t = 8080)]
    port: u16,

    /// Document root served by the filesystem handler.
    #[arg(long, default_value = ".")]
    root: PathBuf,
}

struct ServerApp {
    port: u16,
    root: PathBuf,
}

impl Application for ServerApp {
    fn create(&mut self, runtime: &Runtime) -> ostium::Result<()> {
        HttpServer::bind(
            runtime.reactor(),
            &format!("0.0.0.0:{}", self.port),
            Box::new(FileSystemHandler::new(self.root.clone())),
        )?;

        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("server shut down");
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    let runtime = match Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(error = %err, "failed to initialize runtime");
            return ExitCode::FAILURE;
        }
    };

    let mut app = ServerApp {
        port: args.port,
        root: args.root,
    };

    match runtime.run(&mut app) {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(err) => {
            tracing::error!(error = %err, "server terminated with an error");
            ExitCode::FAILURE
        }
    }
}

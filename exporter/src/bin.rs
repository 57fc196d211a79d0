use std::process::ExitCode;

use clap::Parser;
use error_stack::ResultExt;
use meridian_exporter::cli::Cli;
use meridian_exporter::error::{ExportError, ReportExt, Result};
use meridian_observability::init_tracing;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();
    run_with_args(args).await.to_exit_code()
}

async fn run_with_args(args: Cli) -> Result<()> {
    init_tracing()
        .change_context(ExportError::Configuration)
        .attach_printable("failed to initialize tracing")?;

    let ct = CancellationToken::new();

    ctrlc::set_handler({
        let ct = ct.clone();
        move || {
            info!("termination signal received");
            ct.cancel();
        }
    })
    .change_context(ExportError::Configuration)
    .attach_printable("failed to set termination handler")?;

    args.run(ct).await
}

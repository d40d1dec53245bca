use clap::Parser;
use ddiscan::{web::Web, Cli, Session, VERSION};
use log::info;
use miette::Result;
use std::time::Duration;
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle, Toplevel};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .parse_default_env()
        .init();

    info!("ddiscan {} starting", VERSION);

    Toplevel::new(|s: SubsystemHandle| async move {
        let session = Session::new(&s, args).await;
        let web = Web::new(session);
        s.start(SubsystemBuilder::new("Web", |subsys| web.run(subsys)));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(5))
    .await
    .map_err(Into::into)
}

use clap::Parser;
use confr::cli::Cli;
use confr::log::init_tracing_with;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing_with(cli.log_level.as_deref(), cli.log_json);

    if let Err(err) = confr::runloop::run(cli).await {
        tracing::error!(error = %err, "confr exited with error");
        std::process::exit(exit_code_for(&err));
    }
}

fn exit_code_for(_err: &confr::ConfrError) -> i32 {
    1
}

mod actions;
pub(crate) mod arguments;

use clap::Parser;

pub async fn run() -> eyre::Result<()> {
    let args = arguments::Args::parse();
    actions::run(args).await
}

// pvsbridge entry point

use anyhow::anyhow;
use pvsbridge_cli::CommandRouter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    CommandRouter::route()
        .await
        .map_err(|e| anyhow!(e.user_message()))
}

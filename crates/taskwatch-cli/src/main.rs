//! taskwatch - inspect running processes and the code they load.

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    taskwatch_cli::run().await
}

// Herald server entry point.
use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    herald_server::server::run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

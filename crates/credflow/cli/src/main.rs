#[tokio::main]
async fn main() -> anyhow::Result<()> {
    credflow_cli::run().await?;
    Ok(())
}

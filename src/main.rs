#[tokio::main]
async fn main() -> anyhow::Result<()> {
    vidwatch::run().await
}

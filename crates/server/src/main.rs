#[tokio::main]
async fn main() -> anyhow::Result<()> {
    strela_server::run().await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    chat_relay::app::run().await
}

use fpga_miner::daemon::Daemon;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fpga_miner::tracing::init_journald_or_stdout();

    Daemon::new().run().await
}

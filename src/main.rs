//! Removes PCR duplicates from a coordinate sorted single-end SAM file using known UMIs.

use anyhow::Result;
use env_logger::Env;

mod app;
pub mod header;
pub mod io;
pub mod markdups;
pub mod metrics;
pub mod record;
pub mod umis;

use app::App;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let mut app = App::new().await?;
    app.run().await?;

    Ok(())
}

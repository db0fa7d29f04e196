use clap::Parser;
use liquid_frame::error::LiquidError;
use liquid_frame::mrtask::TaskError;
use liquid_frame::{logging, ChunkSet, FrameBuilder, MRTask, NewChunk, Node, Settings};
use log::info;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// A node of a `liquid_frame` cluster. Once `nodes` nodes have joined, node 1
/// builds a frame of random doubles spread over every node and sums it with
/// an `MRTask`. Every node then serves until the server shuts the cluster
/// down.
#[derive(Parser)]
#[command(version = "1.0")]
struct Opts {
    /// The IP:Port at which the registration server is running
    #[arg(short = 's', long = "server_addr", default_value = "127.0.0.1:9000")]
    server_address: String,
    /// The IP this node listens on
    #[arg(short = 'm', long = "my_ip", default_value = "127.0.0.1")]
    my_ip: String,
    /// The number of nodes to wait for
    #[arg(short = 'n', long = "nodes", default_value_t = 3)]
    nodes: usize,
    /// The number of rows of the generated frame
    #[arg(short = 'r', long = "rows", default_value_t = 1_000_000)]
    rows: usize,
    /// A TOML settings file
    #[arg(short = 'c', long = "config")]
    config: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Sum {
    sum: f64,
    count: usize,
}

impl MRTask for Sum {
    const NAME: &'static str = "client::Sum";

    fn map(&mut self, chunks: &ChunkSet, _: &mut [NewChunk]) -> Result<(), TaskError> {
        for v in chunks.column(0)?.to_doubles() {
            if !v.is_nan() {
                self.sum += v;
                self.count += 1;
            }
        }
        Ok(())
    }

    fn reduce(&mut self, other: Self) {
        self.sum += other.sum;
        self.count += other.count;
    }
}

#[tokio::main]
async fn main() -> Result<(), LiquidError> {
    let opts = Opts::parse();
    let settings = Settings::load(opts.config.as_deref())?;
    logging::init(&settings.logging);

    let rows_per_chunk = settings.ingest.rows_per_chunk;
    let node = Node::connect(&opts.server_address, &opts.my_ip, settings).await?;
    node.register::<Sum>();
    node.wait_for_members(opts.nodes).await?;
    info!("Node {} sees {} members", node.id, opts.nodes);

    if node.id == 1 {
        let mut rng = rand::thread_rng();
        let values: Vec<f64> = (0..opts.rows).map(|_| rng.gen()).collect();
        let frame = FrameBuilder::new(rows_per_chunk)
            .numeric("x", values)
            .build(&node.kv)
            .await?;
        let sum = node.run(Sum::default(), &[&frame]).await?;
        println!(
            "sum: {}, count: {}, mean: {}",
            sum.sum,
            sum.count,
            sum.sum / sum.count as f64
        );
        frame.delete(&node.kv).await?;
    }

    node.wait_for_kill().await;
    Ok(())
}

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use grovekv::node::api::grpc::grove_client::GroveClient;
use grovekv::node::api::grpc::{GetRequest, SetRequest, TakeSnapshotRequest};

#[derive(Parser)]
#[command(version, about = "grovekv command-line client")]
struct Args {
    /// Servers to try, in order
    #[arg(
        short,
        long,
        value_delimiter = ',',
        default_value = "http://[::1]:50051"
    )]
    servers: Vec<String>,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Read a key from any reachable node
    Get { key: String },
    /// Write a key through the leader
    Set { key: String, value: String },
    /// Ask the leader to compact its log into a snapshot
    Snapshot,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    for addr in &args.servers {
        let mut client = match GroveClient::connect(addr.clone()).await {
            Ok(client) => client,
            Err(err) => {
                eprintln!("{addr}: unreachable: {err:#}");
                continue;
            }
        };
        match &args.cmd {
            Cmd::Get { key } => {
                let resp = client
                    .get(GetRequest { key: key.clone() })
                    .await?
                    .into_inner();
                if resp.found {
                    println!("{}", resp.value);
                } else {
                    println!("key not found");
                }
                return Ok(());
            }
            Cmd::Set { key, value } => {
                let resp = client
                    .set(SetRequest {
                        key: key.clone(),
                        value: value.clone(),
                    })
                    .await?
                    .into_inner();
                if resp.success {
                    println!("OK");
                    return Ok(());
                }
                if resp.error == "not leader" {
                    // follower answered, move on (its hint may name the leader)
                    eprintln!("{addr}: not leader, hint: {}", resp.leader_id);
                    continue;
                }
                bail!("{addr}: {}", resp.error);
            }
            Cmd::Snapshot => {
                let resp = client.take_snapshot(TakeSnapshotRequest {}).await?.into_inner();
                if resp.success {
                    println!("OK");
                    return Ok(());
                }
                eprintln!("{addr}: snapshot refused, trying next server");
            }
        }
    }
    bail!("no server accepted the request")
}

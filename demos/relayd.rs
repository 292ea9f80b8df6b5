use anyhow::Result;
use relaystore::{Config, Node};
use std::io::Write;
use std::path::PathBuf;
use structopt::StructOpt;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(StructOpt, Debug)]
#[structopt(name = "relayd")]
struct Opt {
    /// The address this node listens on; must be one of the peers.
    #[structopt(short, long)]
    addr: String,
    /// The addresses of all cluster members, this node included.
    #[structopt(short, long, required = true)]
    peers: Vec<String>,
    /// Directory for the consensus state and the store.
    #[structopt(short, long, parse(from_os_str))]
    data_dir: PathBuf,
}

fn prompt() {
    print!("relayd=# ");
    std::io::stdout().flush().unwrap();
}

async fn execute(node: &Node, line: &str) -> Result<()> {
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        ["set", key, value] => node.set(key.as_bytes(), value.as_bytes()).await?,
        ["get", key] => match node.get(key.as_bytes())? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => println!("(nil)"),
        },
        ["rm", key] => {
            node.remove(key.as_bytes()).await?;
        }
        ["leader"] => println!("{}", node.leader().unwrap_or_else(|| "(none)".to_string())),
        ["sync"] => node.rsync().await?,
        [] => {}
        _ => println!("commands: set <key> <value> | get <key> | rm <key> | leader | sync"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();
    let opt = Opt::from_args();
    let config = Config::new(opt.peers, opt.data_dir);
    let node = Node::bind(config, opt.addr.as_str()).await?;

    let stdin = tokio::io::stdin();
    let rdr = BufReader::new(stdin);
    let mut lines = rdr.lines();
    prompt();
    while let Some(line) = lines.next_line().await? {
        if let Err(e) = execute(&node, &line).await {
            println!("error: {}", e);
        }
        prompt();
    }
    node.close().await?;
    Ok(())
}

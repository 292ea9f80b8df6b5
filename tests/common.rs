use relaystore::{Config, Node};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

pub struct Cluster {
    pub nodes: Vec<Node>,
    peers: Vec<String>,
    configure: Box<dyn Fn(Config) -> Config + Send + Sync>,
    dirs: Vec<TempDir>,
}

pub async fn make_cluster(nr: usize) -> Cluster {
    make_cluster_with(nr, |config| config).await
}

pub async fn make_cluster_with<F>(nr: usize, configure: F) -> Cluster
where
    F: Fn(Config) -> Config + Send + Sync + 'static,
{
    let _ = pretty_env_logger::try_init();
    let mut listeners = Vec::new();
    for _ in 0..nr {
        listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
    }
    let peers: Vec<String> = listeners
        .iter()
        .map(|listener| listener.local_addr().unwrap().to_string())
        .collect();
    let dirs: Vec<TempDir> = (0..nr).map(|_| tempfile::tempdir().unwrap()).collect();

    let mut starts = Vec::new();
    for (listener, dir) in listeners.into_iter().zip(&dirs) {
        let config = node_config(&configure, &peers, dir.path());
        starts.push(tokio::task::spawn(Node::start(config, listener)));
    }
    let mut nodes = Vec::new();
    for start in starts {
        nodes.push(start.await.unwrap().unwrap());
    }
    Cluster {
        nodes,
        peers,
        configure: Box::new(configure),
        dirs,
    }
}

fn node_config<F>(configure: &F, peers: &[String], dir: &Path) -> Config
where
    F: Fn(Config) -> Config + ?Sized,
{
    let mut config = configure(Config::new(peers.to_vec(), dir));
    config.command_timeout = Duration::from_secs(10);
    config.dial_timeout = Duration::from_secs(2);
    config.leader_wait = Duration::from_secs(30);
    config.leader_poll = Duration::from_millis(100);
    config
}

impl Cluster {
    /// Index of the node that currently believes it is the leader.
    pub async fn leader(&self) -> usize {
        for _ in 0..100 {
            if let Some(idx) = self.nodes.iter().position(|node| node.is_leader()) {
                return idx;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("no leader elected");
    }

    /// Index of some node that is not the leader.
    pub async fn follower(&self) -> usize {
        let leader = self.leader().await;
        (leader + 1) % self.nodes.len()
    }

    /// Close node `idx` and start it again on the same address and data
    /// directory.
    pub async fn restart(&mut self, idx: usize) {
        let node = self.nodes.remove(idx);
        let addr = node.addr().to_string();
        node.close().await.unwrap();
        drop(node);

        let mut listener = None;
        for _ in 0..50 {
            match TcpListener::bind(&addr).await {
                Ok(bound) => {
                    listener = Some(bound);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }
        let listener = listener.expect("address still in use");
        let dir = self.dirs[self.dir_of(&addr)].path().to_path_buf();
        let config = node_config(&*self.configure, &self.peers, &dir);
        let node = Node::start(config, listener).await.unwrap();
        self.nodes.insert(idx, node);
    }

    fn dir_of(&self, addr: &str) -> usize {
        self.peers.iter().position(|peer| peer == addr).unwrap()
    }

    pub async fn halt(self) {
        for node in &self.nodes {
            node.close().await.unwrap();
        }
    }
}

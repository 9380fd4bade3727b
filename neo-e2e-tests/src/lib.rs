//! In-process cluster harness: one master and N storages over real sockets
//! on ephemeral ports, plus helpers the end-to-end tests share.

use std::time::Duration;

use neo_client::{Client, ClientConfig};
use neo_common::Address;
use neo_master::{Master, MasterConfig, MasterHandle};
use neo_storage::{StorageConfig, StorageHandle, StorageNode};

/// Name every harness cluster runs under.
pub const CLUSTER: &str = "test";

/// One master plus its storages, torn down on drop.
pub struct TestCluster {
    /// The master.
    pub master: MasterHandle,
    /// The storages, in start order.
    pub storages: Vec<StorageHandle>,
}

impl TestCluster {
    /// Start a cluster of `storages` nodes over `partitions` partitions
    /// with `replicas` extra copies, and wait for it to become operational.
    pub async fn start(partitions: u32, replicas: u32, storages: usize) -> TestCluster {
        let master = Master::start(MasterConfig {
            bind: ephemeral(),
            cluster: CLUSTER.into(),
            partitions,
            replicas,
        })
        .await
        .expect("master starts");

        let mut nodes = Vec::with_capacity(storages);
        for _ in 0..storages {
            nodes.push(
                StorageNode::start(StorageConfig {
                    bind: ephemeral(),
                    masters: vec![master.addr().clone()],
                    cluster: CLUSTER.into(),
                    id: None,
                })
                .await
                .expect("storage starts"),
            );
        }

        let cluster = TestCluster {
            master,
            storages: nodes,
        };
        cluster.wait_operational().await;
        cluster
    }

    /// Wait for the partition table to accept transactions, every replica
    /// to be readable, and every storage to serve.
    pub async fn wait_operational(&self) {
        wait_until(Duration::from_secs(10), || {
            self.master.master.operational()
                && self.master.master.fully_replicated()
                && self.storages.iter().all(|s| s.storage.ready())
        })
        .await;
    }

    /// The client configuration pointing at this cluster.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::new(vec![self.master.addr().clone()], CLUSTER)
    }

    /// A connected client.
    pub async fn client(&self) -> Client {
        Client::connect(self.client_config())
            .await
            .expect("client connects")
    }
}

fn ephemeral() -> Address {
    Address::new("127.0.0.1", 0)
}

/// Poll `cond` until it holds or the deadline passes.
pub async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if cond() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within {limit:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

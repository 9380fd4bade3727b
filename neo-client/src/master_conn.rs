//! The client's session with the primary master: discovery, identification,
//! initial roster and partition table, and the asynchronous notification
//! stream.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use neo_common::{Node, NodeState, NodeType, PartitionTable};
use neo_errors::{NeoError, NeoResult};
use neo_protocol::Message;

use crate::conn::ClientConn;
use crate::pool::ConnectionPool;
use crate::{Client, ClientServices};

/// How long identification retries on `NotReady` before sleeping again.
const NOT_READY_RETRY: Duration = Duration::from_secs(1);
/// Pause between dial attempts while hunting for the primary.
const DIAL_RETRY: Duration = Duration::from_millis(500);
/// Total budget for the cluster to become operational during bootstrap.
const OPERATIONAL_TIMEOUT: Duration = Duration::from_secs(30);

impl Client {
    /// The connection to the primary master, establishing it on demand.
    /// Connection attempts are serialized; concurrent callers share the
    /// outcome.
    pub(crate) async fn master_link(&self) -> NeoResult<Arc<ClientConn>> {
        let mut link = self.master.lock().await;
        if let Some(conn) = link.as_ref() {
            if !conn.is_closed() {
                return Ok(Arc::clone(conn));
            }
        }
        let conn = connect_to_primary(&self.services).await?;
        *link = Some(Arc::clone(&conn));
        Ok(conn)
    }

    /// Drop the cached master connection so the next call re-bootstraps.
    pub(crate) async fn invalidate_master_link(&self) {
        let mut link = self.master.lock().await;
        if let Some(conn) = link.take() {
            conn.close();
        }
    }

    /// Send a request to the primary master and wait for its answer,
    /// re-establishing the session once if the connection drops mid-flight.
    pub(crate) async fn ask_master(&self, msg: Message) -> NeoResult<Message> {
        for attempt in 0..2 {
            let conn = self.master_link().await?;
            match conn.ask(msg.clone())?.wait().await {
                Err(NeoError::ConnectionClosed) if attempt == 0 => {
                    warn!("master connection lost mid-request, reconnecting");
                    self.invalidate_master_link().await;
                }
                other => return other,
            }
        }
        Err(NeoError::ConnectionClosed)
    }

    /// Send a notification to the primary master.
    pub(crate) async fn notify_master(&self, msg: Message) -> NeoResult<()> {
        self.master_link().await?.notify(msg)
    }
}

/// Find the primary master, identify, and bootstrap roster plus partition
/// table. Returns once the cluster is operational.
async fn connect_to_primary(services: &Arc<ClientServices>) -> NeoResult<Arc<ClientConn>> {
    let deadline = tokio::time::Instant::now() + OPERATIONAL_TIMEOUT;
    let masters = &services.config.masters;
    if masters.is_empty() {
        return Err(NeoError::Storage("no master addresses configured".into()));
    }
    let mut primary_hint = None;
    let mut index = 0;

    'dial: loop {
        if tokio::time::Instant::now() > deadline {
            return Err(NeoError::Storage(
                "timed out waiting for an operational cluster".into(),
            ));
        }
        let target = match primary_hint.take() {
            Some(addr) => addr,
            None => {
                let addr = masters[index % masters.len()].clone();
                index += 1;
                addr
            }
        };

        debug!(%target, "dialing master");
        let conn = match ClientConn::open(
            &target,
            Arc::clone(&services.dispatcher),
            Some(services.notify_tx.clone()),
            None,
        )
        .await
        {
            Ok(conn) => conn,
            Err(error) => {
                warn!(%target, %error, "master dial failed");
                tokio::time::sleep(DIAL_RETRY).await;
                continue;
            }
        };

        // find out who is primary; follow the referral when the dialed
        // master is not it
        let asked = match conn.ask(Message::AskPrimary) {
            Ok(pending) => pending.wait().await,
            Err(error) => Err(error),
        };
        let primary = match asked {
            Ok(Message::AnswerPrimary { primary }) => primary,
            Ok(other) => {
                warn!(answer = other.name(), "unexpected answer to AskPrimary");
                conn.close();
                continue;
            }
            Err(error) => {
                warn!(%target, %error, "AskPrimary failed");
                conn.close();
                tokio::time::sleep(DIAL_RETRY).await;
                continue;
            }
        };
        if primary != target {
            info!(%primary, "redirected to primary master");
            conn.close();
            primary_hint = Some(primary);
            continue;
        }

        // identify; NotReady backs off, a refusal drops our identity and
        // asks for a fresh one
        let accepted = loop {
            let pending = match conn.ask(Message::RequestIdentification {
                node_type: NodeType::Client,
                id: *services.id.read(),
                addr: None,
                cluster: services.config.cluster.clone(),
            }) {
                Ok(pending) => pending,
                Err(_) => {
                    tokio::time::sleep(DIAL_RETRY).await;
                    continue 'dial;
                }
            };
            match pending.wait().await {
                Ok(msg @ Message::AcceptIdentification { .. }) => break msg,
                Ok(other) => {
                    warn!(answer = other.name(), "unexpected identification answer");
                    conn.close();
                    continue 'dial;
                }
                Err(NeoError::NodeNotReady(message)) => {
                    info!(message, "master not ready, retrying identification");
                    tokio::time::sleep(NOT_READY_RETRY).await;
                }
                Err(NeoError::Protocol(message)) => {
                    warn!(message, "identification refused, dropping our identity");
                    *services.id.write() = None;
                    tokio::time::sleep(NOT_READY_RETRY).await;
                }
                Err(error) => {
                    warn!(%error, "identification failed");
                    conn.close();
                    tokio::time::sleep(DIAL_RETRY).await;
                    continue 'dial;
                }
            }
        };
        let Message::AcceptIdentification {
            id: master_id,
            num_partitions,
            num_replicas,
            your_id,
            ..
        } = accepted
        else {
            unreachable!("loop above only breaks on AcceptIdentification");
        };

        *services.id.write() = Some(your_id);
        *services.primary.write() = Some(primary.clone());
        services.nodes.insert(Node::running(
            master_id,
            NodeType::Master,
            Some(primary.clone()),
        ));
        conn.set_node(master_id);
        if services.pt.snapshot().is_none() {
            services
                .pt
                .install(PartitionTable::new(num_partitions, num_replicas));
        }
        info!(id = %your_id, %primary, "identified with primary master");

        // roster rows arrive as notifications ahead of the empty answer
        conn.ask(Message::AskNodeInformation)?.wait().await?;
        match conn.ask(Message::AskPartitionTable)?.wait().await? {
            Message::AnswerPartitionTable { ptid, rows } => {
                if let Some(Err(error)) = services.pt.mutate(|pt| pt.load(ptid, &rows)) {
                    warn!(%error, "partition table bootstrap failed");
                    conn.close();
                    continue;
                }
            }
            other => {
                warn!(answer = other.name(), "unexpected partition table answer");
                conn.close();
                continue;
            }
        }

        // ready once the table is operational; roster updates keep flowing
        // through the notification task meanwhile
        loop {
            let operational = services
                .pt
                .snapshot()
                .map(|pt| pt.operational(&services.nodes))
                .unwrap_or(false);
            if operational {
                info!("cluster is operational");
                return Ok(conn);
            }
            if conn.is_closed() {
                warn!("master connection lost while waiting for the cluster");
                continue 'dial;
            }
            if tokio::time::Instant::now() > deadline {
                return Err(NeoError::Storage(
                    "timed out waiting for an operational cluster".into(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// Process unsolicited packets from the primary master for the life of the
/// client.
pub(crate) async fn notification_task(
    services: Arc<ClientServices>,
    pool: Arc<ConnectionPool>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            Message::NotifyNodeInformation { nodes } => {
                services.nodes.apply(&nodes);
                for info in &nodes {
                    if info.node_type == NodeType::Storage && info.state != NodeState::Running {
                        pool.remove(info.id).await;
                    }
                }
            }
            Message::NotifyPartitionChanges { ptid, changes } => {
                services
                    .pt
                    .mutate(|pt| pt.update(ptid, &changes, &services.nodes));
            }
            Message::SendPartitionTable { ptid, rows } => {
                match services.pt.mutate(|pt| pt.load(ptid, &rows)) {
                    Some(Err(error)) => warn!(%error, "dropping bad partition table push"),
                    Some(Ok(())) => {}
                    None => warn!("partition table push before identification"),
                }
            }
            Message::InvalidateObjects { tid, oids } => {
                debug!(%tid, count = oids.len(), "invalidating objects");
                let mut cache = services.cache.lock();
                for oid in oids {
                    cache.remove(oid);
                }
            }
            other => {
                debug!(msg = other.name(), "ignoring notification");
            }
        }
    }
}

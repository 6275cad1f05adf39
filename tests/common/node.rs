//! Test node management.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use weft::config::Config;
use weft::{ChangeType, ConnectionDescription, DataIStream, DataOStream, Distributed, LocalNode};

/// A listening node on an ephemeral port, closed by [`TestNode::stop`].
pub struct TestNode {
    node: LocalNode,
}

impl TestNode {
    pub fn start() -> anyhow::Result<Self> {
        Self::start_with(|_| {})
    }

    /// Start a node after letting `tweak` adjust the default test config.
    pub fn start_with(tweak: impl FnOnce(&mut Config)) -> anyhow::Result<Self> {
        let mut config = Config::default();
        config.listen = vec![ConnectionDescription::tcp("127.0.0.1", 0)];
        config.timeouts.default_ms = 5_000;
        config.timeouts.select_ms = 100;
        tweak(&mut config);
        config.validate()?;

        let node = LocalNode::new(Arc::new(config));
        node.listen()?;
        Ok(Self { node })
    }

    /// The TCP endpoint this node listens on.
    pub fn address(&self) -> ConnectionDescription {
        self.node.descriptions()[0].clone()
    }

    pub async fn connect(&self, other: &TestNode) -> anyhow::Result<()> {
        let peer = self.node.connect_to(&other.address()).await?;
        anyhow::ensure!(peer.id() == other.id(), "connected to the wrong node");
        // The acceptor maps the peer when it answers; wait for it anyway.
        let me = self.id();
        eventually(|| other.get_node(me).is_some()).await?;
        Ok(())
    }

    pub async fn stop(self) -> anyhow::Result<()> {
        self.node.close().await?;
        Ok(())
    }
}

impl Deref for TestNode {
    type Target = LocalNode;

    fn deref(&self) -> &LocalNode {
        &self.node
    }
}

/// Two nodes, the first connected to the second.
pub async fn connected_pair() -> anyhow::Result<(TestNode, TestNode)> {
    let a = TestNode::start()?;
    let b = TestNode::start()?;
    a.connect(&b).await?;
    Ok((a, b))
}

/// Poll `check` until it holds, for up to two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) -> anyhow::Result<()> {
    for _ in 0..200 {
        if check() {
            return Ok(());
        }
        sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("condition not reached within 2 seconds")
}

/// A counter with a label, distributed with the configured change type.
#[derive(Debug)]
pub struct Counter {
    pub value: u64,
    pub label: String,
    kind: ChangeType,
}

impl Counter {
    pub fn new(kind: ChangeType, value: u64) -> Self {
        Self {
            value,
            label: String::new(),
            kind,
        }
    }
}

impl Distributed for Counter {
    fn change_type(&self) -> ChangeType {
        self.kind
    }

    fn get_instance_data(&self, os: &mut DataOStream) {
        os.write(&self.value);
        os.write(&self.label);
    }

    fn apply_instance_data(&mut self, is: &mut DataIStream) {
        self.value = is.read();
        self.label = is.read();
    }

    fn pack(&mut self, os: &mut DataOStream) {
        os.write(&self.value);
    }

    fn unpack(&mut self, is: &mut DataIStream) {
        self.value = is.read();
    }
}

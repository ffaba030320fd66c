// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The cluster facade composes the locator and the nodes and runs the
//! driver thread. Submission asks the locator for `replicas + 1` nodes
//! and dispatches to each; refusals and shortfalls become failure events
//! so reply aggregation always completes.

use crate::driver::{Control, Driver, Settings, WAKER_TOKEN};
use crate::*;
use config::{ConnectionConfig, SaslConfig};
use crossbeam_channel::unbounded;
use metriken::*;
use std::io::{Error, ErrorKind, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use ::net::{Poll, Waker};

#[metric(name = "request_dispatch", description = "requests submitted")]
pub static REQUEST_DISPATCH: Counter = Counter::new();

#[metric(
    name = "request_fail",
    description = "dispatch attempts completed with a synthetic failure"
)]
pub static REQUEST_FAIL: Counter = Counter::new();

const THREAD_NAME: &str = "cluster_driver";

// how long shutdown waits for quit handshakes before force-disposing
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Node selection policy for the cluster.
pub enum LocatorPolicy {
    RoundRobin,
    Ketama,
    VBucket(VBucketMap),
}

pub struct ClusterBuilder {
    endpoints: Vec<SocketAddr>,
    pool_size: usize,
    settings: Settings,
    policy: LocatorPolicy,
    authenticator: Option<Arc<dyn Authenticator>>,
    observers: Observers,
    transport_factory: Arc<dyn TransportFactory>,
    node_factory: Arc<dyn NodeFactory>,
}

impl ClusterBuilder {
    pub fn new() -> Self {
        Self {
            endpoints: Vec::new(),
            pool_size: 2,
            settings: Settings::default(),
            policy: LocatorPolicy::RoundRobin,
            authenticator: None,
            observers: Observers::new(),
            transport_factory: Arc::new(DefaultTransportFactory),
            node_factory: Arc::new(DefaultNodeFactory),
        }
    }

    /// Initialize a builder from configuration. The vbucket policy needs
    /// a server map and must be set programmatically.
    pub fn from_config<T: ConnectionConfig + SaslConfig>(
        config: &T,
        endpoints: &[String],
        pool_size: usize,
        locator: &str,
    ) -> Result<Self> {
        let mut builder = Self::new();
        builder.settings = Settings::from(config.connection());
        builder.pool_size = std::cmp::max(pool_size, 1);

        for endpoint in endpoints {
            let addr = endpoint.parse().map_err(|_| {
                error!("bad endpoint: {}", endpoint);
                Error::new(ErrorKind::InvalidInput, "bad endpoint")
            })?;
            builder.endpoints.push(addr);
        }

        builder.policy = match locator {
            "round_robin" => LocatorPolicy::RoundRobin,
            "ketama" => LocatorPolicy::Ketama,
            other => {
                error!("unknown locator: {}", other);
                return Err(Error::new(ErrorKind::InvalidInput, "unknown locator"));
            }
        };

        if config.sasl().enabled() {
            builder.authenticator = Some(Arc::new(PlainAuthenticator::new(
                config.sasl().username(),
                config.sasl().password(),
            )));
        }

        Ok(builder)
    }

    pub fn endpoint(mut self, endpoint: SocketAddr) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = std::cmp::max(pool_size, 1);
        self
    }

    pub fn locator(mut self, policy: LocatorPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn observers(mut self, observers: Observers) -> Self {
        self.observers = observers;
        self
    }

    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = factory;
        self
    }

    pub fn node_factory(mut self, factory: Arc<dyn NodeFactory>) -> Self {
        self.node_factory = factory;
        self
    }

    pub fn build(self) -> Result<Cluster> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (ctrl_tx, ctrl_rx) = unbounded();

        let ctx = Arc::new(DriverContext {
            ctrl: ctrl_tx,
            waker,
            settings: self.settings,
            authenticator: self.authenticator,
            observers: Arc::new(self.observers),
        });

        let nodes: Vec<Arc<Node>> = self
            .endpoints
            .iter()
            .map(|&endpoint| {
                self.node_factory.create(
                    &ctx,
                    endpoint,
                    self.pool_size,
                    self.transport_factory.clone(),
                )
            })
            .collect();

        let locator: Box<dyn Locator> = match self.policy {
            LocatorPolicy::RoundRobin => Box::new(RoundRobin::new(nodes.clone())),
            LocatorPolicy::Ketama => Box::new(Ketama::new(nodes.clone())),
            LocatorPolicy::VBucket(map) => Box::new(VBucketServerMap::new(nodes.clone(), map)),
        };

        let mut driver = Driver::new(poll, ctrl_rx);
        let handle = std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || driver.run())?;

        Ok(Cluster {
            nodes,
            locator,
            ctx,
            driver: Some(handle),
        })
    }
}

impl Default for ClusterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Cluster {
    nodes: Vec<Arc<Node>>,
    locator: Box<dyn Locator>,
    ctx: Arc<DriverContext>,
    driver: Option<JoinHandle<()>>,
}

impl Cluster {
    /// Dispatch a request to `replicas + 1` nodes. A node that refuses
    /// already failed the request once; attempts with no node to serve
    /// them fail here so the aggregation sees its full event count.
    pub fn submit(&self, request: Arc<dyn Request>) {
        REQUEST_DISPATCH.increment();

        let attempts = request.replicas() as usize + 1;
        let nodes = self.locator.locate(&request);

        let dispatched = std::cmp::min(nodes.len(), attempts);
        for node in nodes.iter().take(attempts) {
            if !node.try_send(request.clone()) {
                REQUEST_FAIL.increment();
            }
        }
        for _ in dispatched..attempts {
            REQUEST_FAIL.increment();
            request.fail();
        }
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Cooperative shutdown: quit handshakes on every live transport, a
    /// grace period, then force-disposal of whatever remains.
    pub fn shutdown(mut self) {
        for node in &self.nodes {
            node.shutdown();
        }
        std::thread::sleep(SHUTDOWN_GRACE);
        self.stop_driver();
    }

    fn stop_driver(&mut self) {
        if let Some(handle) = self.driver.take() {
            let _ = self.ctx.ctrl.send(Control::Stop);
            let _ = self.ctx.waker.wake();
            let _ = handle.join();
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.stop_driver();
    }
}

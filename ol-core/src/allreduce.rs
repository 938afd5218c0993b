use crate::{
    config::ClusterConfig,
    weights::{Field, WeightStore},
};
use anyhow::{anyhow, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    io::{BufReader, BufWriter, Write},
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    ops::AddAssign,
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info};

/// How long a node keeps retrying its parent before giving up.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_RETRY: Duration = Duration::from_millis(100);

/// Sums values across every worker of a run and hands the total back to
/// each. All calls are collective: every worker must make the same calls in
/// the same order.
pub trait AllReduce: Send {
    fn accumulate_scalar(&mut self, value: f64) -> Result<f64>;

    fn accumulate_f32(&mut self, values: &mut [f32]) -> Result<()>;

    /// Sums one field of every cell across workers.
    fn accumulate(&mut self, store: &mut WeightStore, field: Field) -> Result<()> {
        if !self.is_distributed() {
            return Ok(());
        }
        let mut values = store.field_values(field);
        self.accumulate_f32(&mut values)?;
        store.set_field_values(field, &values);
        Ok(())
    }

    fn is_distributed(&self) -> bool;
}

/// Single worker: every reduction is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct Solo;

impl AllReduce for Solo {
    fn accumulate_scalar(&mut self, value: f64) -> Result<f64> {
        Ok(value)
    }

    fn accumulate_f32(&mut self, _values: &mut [f32]) -> Result<()> {
        Ok(())
    }

    fn is_distributed(&self) -> bool {
        false
    }
}

struct Link {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Link {
    fn new(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream),
        })
    }

    fn send<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        bincode::serialize_into(&mut self.writer, value)?;
        self.writer.flush()?;
        Ok(())
    }

    fn recv<T: DeserializeOwned>(&mut self) -> Result<T> {
        Ok(bincode::deserialize_from(&mut self.reader)?)
    }
}

/// Binary-tree reduction over TCP. Rank `r` reports to `(r - 1) / 2` and
/// collects from `2r + 1` and `2r + 2`; sums travel up, the root's total
/// travels back down.
pub struct TreeAllReduce {
    rank: usize,
    total: usize,
    parent: Option<Link>,
    children: Vec<Link>,
}

pub fn parent_of(rank: usize) -> Option<usize> {
    (rank > 0).then(|| (rank - 1) / 2)
}

pub fn children_of(rank: usize, total: usize) -> Vec<usize> {
    [2 * rank + 1, 2 * rank + 2]
        .into_iter()
        .filter(|c| *c < total)
        .collect()
}

fn connect_with_retry(addr: SocketAddr) -> Result<TcpStream> {
    let deadline = Instant::now() + CONNECT_TIMEOUT;
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() < deadline => {
                debug!("waiting for parent at {}: {}", addr, e);
                thread::sleep(CONNECT_RETRY);
            }
            Err(e) => return Err(anyhow!("Failed to connect to parent at {}: {}", addr, e)),
        }
    }
}

impl TreeAllReduce {
    /// Joins a tree of `total` nodes. `listener` must be bound when this rank
    /// has children; `parent` is required for every rank but 0.
    pub fn join(
        rank: usize,
        total: usize,
        listener: Option<TcpListener>,
        parent: Option<SocketAddr>,
    ) -> Result<Self> {
        if rank >= total {
            return Err(anyhow!("Rank {} is outside a cluster of {}", rank, total));
        }
        let parent = match (parent_of(rank), parent) {
            (None, _) => None,
            (Some(_), None) => return Err(anyhow!("Rank {} needs a parent address", rank)),
            (Some(_), Some(addr)) => {
                let mut link = Link::new(connect_with_retry(addr)?)?;
                link.send(&(rank as u64))?;
                Some(link)
            }
        };

        let expected = children_of(rank, total);
        let mut children = Vec::with_capacity(expected.len());
        if !expected.is_empty() {
            let listener =
                listener.ok_or_else(|| anyhow!("Rank {} has children but no listener", rank))?;
            while children.len() < expected.len() {
                let (stream, peer) = listener.accept()?;
                let mut link = Link::new(stream)?;
                let child = link.recv::<u64>()? as usize;
                if !expected.contains(&child) {
                    return Err(anyhow!(
                        "Unexpected rank {} from {} (expected one of {:?})",
                        child,
                        peer,
                        expected
                    ));
                }
                debug!("rank {} accepted child {} from {}", rank, child, peer);
                children.push((child, link));
            }
            children.sort_by_key(|(child, _)| *child);
        }

        info!("rank {}/{} joined all-reduce tree", rank, total);
        Ok(Self {
            rank,
            total,
            parent,
            children: children.into_iter().map(|(_, link)| link).collect(),
        })
    }

    /// Binds this node's own address from `cluster.nodes` and joins.
    pub fn connect(cluster: &ClusterConfig) -> Result<Self> {
        let total = cluster.nodes.len();
        let rank = cluster.rank;
        let own = cluster
            .nodes
            .get(rank)
            .ok_or_else(|| anyhow!("Rank {} is outside a cluster of {}", rank, total))?;
        let listener = if children_of(rank, total).is_empty() {
            None
        } else {
            Some(TcpListener::bind(own.as_str())?)
        };
        let parent = match parent_of(rank) {
            None => None,
            Some(p) => Some(
                cluster.nodes[p]
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| anyhow!("Cannot resolve '{}'", cluster.nodes[p]))?,
            ),
        };
        Self::join(rank, total, listener, parent)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn total(&self) -> usize {
        self.total
    }

    fn reduce<T>(&mut self, values: &mut [T]) -> Result<()>
    where
        T: Copy + AddAssign + Serialize + DeserializeOwned,
    {
        for child in self.children.iter_mut() {
            let partial: Vec<T> = child.recv()?;
            if partial.len() != values.len() {
                return Err(anyhow!(
                    "All-reduce length mismatch: {} vs {}",
                    partial.len(),
                    values.len()
                ));
            }
            for (v, p) in values.iter_mut().zip(partial) {
                *v += p;
            }
        }
        if let Some(parent) = self.parent.as_mut() {
            parent.send(&*values)?;
            let sum: Vec<T> = parent.recv()?;
            if sum.len() != values.len() {
                return Err(anyhow!(
                    "All-reduce length mismatch: {} vs {}",
                    sum.len(),
                    values.len()
                ));
            }
            values.copy_from_slice(&sum);
        }
        for child in self.children.iter_mut() {
            child.send(&*values)?;
        }
        Ok(())
    }
}

impl AllReduce for TreeAllReduce {
    fn accumulate_scalar(&mut self, value: f64) -> Result<f64> {
        let mut v = [value];
        self.reduce(&mut v)?;
        Ok(v[0])
    }

    fn accumulate_f32(&mut self, values: &mut [f32]) -> Result<()> {
        self.reduce(values)
    }

    fn is_distributed(&self) -> bool {
        self.total > 1
    }
}
